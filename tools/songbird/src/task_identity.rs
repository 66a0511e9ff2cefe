use sha2::{Digest, Sha256};

/// Hex characters kept from the digest. Short enough to read in logs, long enough
/// that a session's few hundred tasks never collide.
pub const TASK_ID_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskIdentity {
    pub speaker: String,
    pub mode: String,
    pub source_file: String,
}

impl TaskIdentity {
    pub fn new(speaker: &str, mode: &str, source_file: &str) -> Self {
        Self {
            speaker: speaker.trim().to_string(),
            mode: mode.trim().to_string(),
            source_file: source_file.trim().to_string(),
        }
    }

    pub fn canonical(&self) -> String {
        format!("{}|{}|{}", self.speaker, self.mode, self.source_file)
    }

    pub fn task_id(&self) -> String {
        let mut digest = Sha256::new();
        digest.update(self.canonical().as_bytes());
        let bytes = digest.finalize();
        let mut out = String::with_capacity(TASK_ID_LEN);
        for byte in bytes.iter().take(TASK_ID_LEN / 2) {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

pub fn compute_task_id(speaker: &str, mode: &str, source_file: &str) -> String {
    TaskIdentity::new(speaker, mode, source_file).task_id()
}

#[cfg(test)]
mod tests {
    use super::{compute_task_id, TaskIdentity, TASK_ID_LEN};

    #[test]
    fn task_id_is_stable_and_ignores_surrounding_whitespace() {
        let first = compute_task_id("21525", "noise", "clip01.wav");
        let second = compute_task_id(" 21525 ", "noise", "clip01.wav\n");
        assert_eq!(first, second);
        assert_eq!(first.len(), TASK_ID_LEN);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn every_identity_component_changes_the_id() {
        let base = compute_task_id("21525", "noise", "clip01.wav");
        assert_ne!(base, compute_task_id("23723", "noise", "clip01.wav"));
        assert_ne!(base, compute_task_id("21525", "pitch", "clip01.wav"));
        assert_ne!(base, compute_task_id("21525", "noise", "clip02.wav"));
    }

    #[test]
    fn canonical_form_is_pipe_delimited() {
        assert_eq!(
            TaskIdentity::new("s1", "warp", "a.wav").canonical(),
            "s1|warp|a.wav"
        );
    }
}
