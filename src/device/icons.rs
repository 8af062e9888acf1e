//! Key status images
//!
//! Rendering is someone else's job: images arrive already encoded in the
//! deck's native format and are only looked up and transferred here.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

/// What a recording key controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    PushToTalk,
    Toggle,
}

impl KeyRole {
    fn file_stem(self, active: bool) -> &'static str {
        match (self, active) {
            (KeyRole::PushToTalk, false) => "ptt_idle",
            (KeyRole::PushToTalk, true) => "ptt_active",
            (KeyRole::Toggle, false) => "toggle_idle",
            (KeyRole::Toggle, true) => "toggle_active",
        }
    }
}

/// Source of encoded key images
pub trait KeyImageEncoder: Send + Sync {
    /// Encoded image for a key role, or `None` to leave the key untouched
    fn encode(&self, role: KeyRole, active: bool) -> Option<Vec<u8>>;
}

/// Pre-encoded images loaded from a directory
#[derive(Debug, Default, Clone)]
pub struct IconSet {
    images: HashMap<(KeyRole, bool), Vec<u8>>,
}

impl IconSet {
    /// Load `<stem>.jpg` files; missing files are skipped with a warning
    pub fn load(dir: &Path) -> Self {
        let mut images = HashMap::new();

        for role in [KeyRole::PushToTalk, KeyRole::Toggle] {
            for active in [false, true] {
                let path = dir.join(format!("{}.jpg", role.file_stem(active)));
                match std::fs::read(&path) {
                    Ok(bytes) if !bytes.is_empty() => {
                        debug!(?path, bytes = bytes.len(), "key image loaded");
                        images.insert((role, active), bytes);
                    }
                    Ok(_) => warn!(?path, "key image is empty"),
                    Err(e) => warn!(?path, error = %e, "key image unavailable"),
                }
            }
        }

        Self { images }
    }

    /// Number of images available
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl KeyImageEncoder for IconSet {
    fn encode(&self, role: KeyRole, active: bool) -> Option<Vec<u8>> {
        self.images.get(&(role, active)).cloned()
    }
}
