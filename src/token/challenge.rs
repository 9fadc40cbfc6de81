//! Challenges and the append-only challenge set shared by signers.
//!
//! A [`ChallengeSet`] has exactly one writer (the caller or the
//! coordinator acting for it). Every signer reads the same set through
//! its own [`ChallengeFeed`], so challenges appended once reach every live
//! signer. The set only grows, and its `final` flag only ever goes from
//! false to true.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Opaque credential identifier issued by a token at enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle(Vec<u8>);

impl KeyHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a hex-encoded key handle.
    pub fn from_hex(text: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(text.trim()).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// A sign (or pre-enroll check) challenge for one key handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub challenge_hash: Vec<u8>,
    pub app_id_hash: Vec<u8>,
    pub key_handle: KeyHandle,
    /// Protocol version the key handle was issued under, if known.
    /// A device reporting a different version is never asked.
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ChallengeList {
    challenges: Vec<Challenge>,
    finalized: bool,
    /// Number of accepted `add_challenges` calls.
    generation: u64,
}

/// Writer side of the shared challenge sequence.
#[derive(Debug)]
pub struct ChallengeSet {
    tx: watch::Sender<ChallengeList>,
}

impl ChallengeSet {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ChallengeList::default());
        Self { tx }
    }

    /// Append challenges, optionally marking the set final.
    ///
    /// Returns `false` without touching the set if it was already final.
    pub fn add_challenges(&self, challenges: Vec<Challenge>, is_final: bool) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|list| {
            if list.finalized {
                return false;
            }
            list.challenges.extend(challenges);
            list.finalized = is_final;
            list.generation += 1;
            accepted = true;
            true
        });
        accepted
    }

    /// A new reader positioned at the current contents.
    pub fn subscribe(&self) -> ChallengeFeed {
        ChallengeFeed {
            rx: self.tx.subscribe(),
            writer_gone: false,
        }
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_final(&self) -> bool {
        self.tx.borrow().finalized
    }
}

impl Default for ChallengeSet {
    fn default() -> Self {
        Self::new()
    }
}

/// What a reader currently knows about the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedView {
    pub len: usize,
    pub finalized: bool,
    /// Whether the writer has added anything (or gone away) yet.
    pub started: bool,
}

/// Reader side of a [`ChallengeSet`].
#[derive(Debug)]
pub struct ChallengeFeed {
    rx: watch::Receiver<ChallengeList>,
    writer_gone: bool,
}

impl ChallengeFeed {
    /// Current length and flags. Marks the contents as seen, so the next
    /// [`ChallengeFeed::changed`] waits for a later write.
    pub fn view(&mut self) -> FeedView {
        let list = self.rx.borrow_and_update();
        FeedView {
            len: list.challenges.len(),
            finalized: list.finalized || self.writer_gone,
            started: list.generation > 0 || self.writer_gone,
        }
    }

    pub fn get(&self, index: usize) -> Option<Challenge> {
        self.rx.borrow().challenges.get(index).cloned()
    }

    /// Wait for the next write. A dropped writer counts as finalising the
    /// set; after that this returns immediately.
    pub async fn changed(&mut self) {
        if self.writer_gone {
            return;
        }
        if self.rx.changed().await.is_err() {
            self.writer_gone = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(tag: u8) -> Challenge {
        Challenge {
            challenge_hash: vec![tag; 32],
            app_id_hash: vec![0xaa; 32],
            key_handle: KeyHandle::new(vec![tag; 4]),
            version: None,
        }
    }

    #[test]
    fn final_set_rejects_further_challenges() {
        let set = ChallengeSet::new();
        assert!(set.add_challenges(vec![challenge(1)], false));
        assert!(set.add_challenges(vec![challenge(2)], true));
        assert!(set.is_final());

        assert!(!set.add_challenges(vec![challenge(3)], false));
        assert!(!set.add_challenges(Vec::new(), true));
        assert_eq!(set.len(), 2);
        assert!(set.is_final());
    }

    #[test]
    fn feed_sees_appends_in_order() {
        let set = ChallengeSet::new();
        let mut feed = set.subscribe();
        assert!(!feed.view().started);

        set.add_challenges(vec![challenge(1), challenge(2)], false);
        let view = feed.view();
        assert!(view.started);
        assert_eq!(view.len, 2);
        assert!(!view.finalized);
        assert_eq!(feed.get(1).unwrap().key_handle, KeyHandle::new(vec![2; 4]));
        assert!(feed.get(2).is_none());
    }

    #[tokio::test]
    async fn feed_wakes_on_write() {
        let set = ChallengeSet::new();
        let mut feed = set.subscribe();
        feed.view();

        set.add_challenges(vec![challenge(7)], true);
        feed.changed().await;
        let view = feed.view();
        assert_eq!(view.len, 1);
        assert!(view.finalized);
    }

    #[tokio::test]
    async fn dropped_writer_finalizes_the_feed() {
        let set = ChallengeSet::new();
        let mut feed = set.subscribe();
        set.add_challenges(vec![challenge(1)], false);
        assert!(!feed.view().finalized);
        drop(set);

        feed.changed().await;
        let view = feed.view();
        assert!(view.finalized);
        assert_eq!(view.len, 1);
        // Returns immediately from now on.
        feed.changed().await;
    }

    #[test]
    fn key_handle_hex_round_trip() {
        let handle = KeyHandle::from_hex("00ff10").unwrap();
        assert_eq!(handle.as_bytes(), &[0x00, 0xff, 0x10]);
        assert_eq!(handle.to_string(), "00ff10");
        assert!(KeyHandle::from_hex("zz").is_err());
    }
}
