//! ISD-R application identifiers.
//!
//! Consumer eUICCs from some vendors answer on a non-standard ISD-R AID, so
//! session setup tries each known one in order.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AidCandidate {
    pub name: &'static str,
    pub aid: &'static [u8],
}

impl fmt::Display for AidCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, hex::encode_upper(self.aid))
    }
}

/// GSMA SGP.22 ISD-R.
pub const GSMA_ISD_R: AidCandidate = AidCandidate {
    name: "GSMA ISD-R",
    aid: &[
        0xA0, 0x00, 0x00, 0x05, 0x59, 0x10, 0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0x89, 0x00, 0x00, 0x01,
        0x00,
    ],
};

/// Tried first to last; the standard AID always leads.
pub const CANDIDATES: &[AidCandidate] = &[
    GSMA_ISD_R,
    AidCandidate {
        name: "5ber Ultra",
        aid: &[
            0xA0, 0x00, 0x00, 0x05, 0x59, 0x10, 0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0x89, 0x00, 0x05,
            0x05, 0x00,
        ],
    },
    AidCandidate {
        name: "eSIM.me v2",
        aid: &[
            0xA0, 0x00, 0x00, 0x05, 0x59, 0x10, 0x10, 0x00, 0x00, 0x00, 0x89, 0x00, 0x00, 0x00,
            0x03, 0x00,
        ],
    },
    AidCandidate {
        name: "ESTKme 2025",
        aid: &[
            0xA0, 0x65, 0x73, 0x74, 0x6B, 0x6D, 0x65, 0xFF, 0xFF, 0xFF, 0xFF, 0x49, 0x53, 0x44,
            0x2D, 0x52,
        ],
    },
    AidCandidate {
        name: "XeSIM",
        aid: &[
            0xA0, 0x00, 0x00, 0x05, 0x59, 0x10, 0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0x89, 0x00, 0x00,
            0x01, 0x77,
        ],
    },
    AidCandidate {
        name: "GlocalMe",
        aid: &[
            0xA0, 0x00, 0x00, 0x06, 0x28, 0x10, 0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0x89, 0x00, 0x00,
            0x01, 0x00,
        ],
    },
];

/// Walks a candidate list in order, logging why each attempt failed.
#[derive(Debug)]
pub struct AidTrial<'a> {
    remaining: std::slice::Iter<'a, AidCandidate>,
    rejected: usize,
}

impl<'a> AidTrial<'a> {
    pub fn new(candidates: &'a [AidCandidate]) -> Self {
        Self {
            remaining: candidates.iter(),
            rejected: 0,
        }
    }

    pub fn next_candidate(&mut self) -> Option<AidCandidate> {
        self.remaining.next().copied()
    }

    pub fn reject(&mut self, candidate: AidCandidate, reason: impl fmt::Display) {
        tracing::warn!(aid = %candidate, error = %reason, "failed to create LPA client");
        self.rejected += 1;
    }

    /// Candidates rejected so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_aid_is_tried_first() {
        assert_eq!(CANDIDATES[0], GSMA_ISD_R);
        assert_eq!(
            hex::encode_upper(GSMA_ISD_R.aid),
            "A0000005591010FFFFFFFF8900000100"
        );
        assert!(CANDIDATES.iter().all(|c| c.aid.len() == 16));
    }

    #[test]
    fn trial_exhausts_in_order() {
        let mut trial = AidTrial::new(&CANDIDATES[..2]);
        let first = trial.next_candidate().unwrap();
        trial.reject(first, "6A82");
        let second = trial.next_candidate().unwrap();
        assert_eq!(second.name, "5ber Ultra");
        assert!(trial.next_candidate().is_none());
        assert_eq!(trial.rejected(), 1);
    }
}
