//! Tracked document state.

/// Client-side record of an open document: URI, language id, monotonically
/// increasing version and last-known full text.
///
/// Used both for normal `textDocument/did*` synchronization and for crash
/// replay, where the mirrored copy is the source of truth.
#[derive(Debug, Clone)]
pub struct TrackedDocument {
    pub uri: String,
    pub language_id: String,
    pub version: i32,
    pub text: String,
}

impl TrackedDocument {
    /// Create a freshly opened document at version 1.
    pub fn new(
        uri: impl Into<String>,
        language_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            language_id: language_id.into(),
            version: 1,
            text: text.into(),
        }
    }

    /// Replace the full text and bump the version. Returns the new version.
    ///
    /// Change tracking is whole-document: incremental edits are folded into
    /// a full resync, which is always correct even when it is not minimal.
    pub fn apply_full_change(&mut self, text: impl Into<String>) -> i32 {
        self.text = text.into();
        self.version += 1;
        self.version
    }
}
