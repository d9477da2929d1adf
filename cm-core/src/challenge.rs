//! Challenge construction for the two probe rounds

use cm_protocol::ChallengeMessage;

use crate::content::ContentStore;
use crate::error::Result;
use crate::identity::IdentityId;
use crate::probe::Fingerprint;

/// Which round a challenge belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    /// Cache check against an unreachable URL
    Detection,
    /// Real download that plants one bit of a new value
    Marking,
}

/// Request for the client to load one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub identity: IdentityId,
    pub probe_id: usize,
    pub probe_uuid: String,
    pub url: String,
    pub digest: String,
    pub force_refetch: bool,
    pub round: Round,
}

impl Challenge {
    pub fn to_message(&self) -> ChallengeMessage {
        ChallengeMessage {
            identity: self.identity.to_string(),
            probe_id: self.probe_id as u32,
            probe_uuid: self.probe_uuid.clone(),
            url: self.url.clone(),
            hash: self.digest.clone(),
            force_refetch: self.force_refetch,
        }
    }
}

/// Delivers challenges to the client of an identity
#[cfg_attr(test, mockall::automock)]
pub trait ChallengeSink: Send + Sync {
    fn issue_challenge(&self, challenge: &Challenge) -> Result<()>;
}

/// One challenge per probe, all pointed at `unreachable_url`
pub fn detection_round(
    content: &dyn ContentStore,
    identity: &IdentityId,
    unreachable_url: &str,
) -> Result<Vec<Challenge>> {
    (0..content.probe_count())
        .map(|probe_id| {
            let asset = content.asset(probe_id)?;
            Ok(Challenge {
                identity: identity.clone(),
                probe_id,
                probe_uuid: asset.uuid,
                url: unreachable_url.to_string(),
                digest: asset.digest,
                force_refetch: false,
                round: Round::Detection,
            })
        })
        .collect()
}

/// Forced real downloads for the set bits of `value`; unset bits get nothing
pub fn marking_round(
    content: &dyn ContentStore,
    identity: &IdentityId,
    value: Fingerprint,
) -> Result<Vec<Challenge>> {
    value
        .positions()
        .filter(|probe_id| *probe_id < content.probe_count())
        .map(|probe_id| {
            let asset = content.asset(probe_id)?;
            Ok(Challenge {
                identity: identity.clone(),
                probe_id,
                probe_uuid: asset.uuid,
                url: asset.url,
                digest: asset.digest,
                force_refetch: true,
                round: Round::Marking,
            })
        })
        .collect()
}

/// Issue challenges in order, stopping at the first failure
pub fn issue_all(sink: &dyn ChallengeSink, challenges: &[Challenge]) -> Result<()> {
    for challenge in challenges {
        sink.issue_challenge(challenge)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ManifestContentStore, ProbeAsset};
    use crate::error::CacheMarkError;

    fn manifest(n: usize) -> ManifestContentStore {
        ManifestContentStore::new(
            (0..n)
                .map(|i| ProbeAsset {
                    url: format!("http://cdn/{}", i),
                    uuid: format!("probe-{}", i),
                    digest: format!("digest-{}", i),
                })
                .collect(),
        )
        .unwrap()
    }

    struct Unavailable;

    impl ContentStore for Unavailable {
        fn probe_count(&self) -> usize {
            4
        }
        fn asset(&self, index: usize) -> Result<ProbeAsset> {
            Err(CacheMarkError::content_unavailable(index, "offline"))
        }
    }

    #[test]
    fn test_detection_round_uses_unreachable_url() {
        let id = IdentityId::from("a");
        let challenges = detection_round(&manifest(6), &id, "http://127.0.0.1:0").unwrap();
        assert_eq!(challenges.len(), 6);
        for (i, c) in challenges.iter().enumerate() {
            assert_eq!(c.probe_id, i);
            assert_eq!(c.url, "http://127.0.0.1:0");
            assert_eq!(c.probe_uuid, format!("probe-{}", i));
            assert!(!c.force_refetch);
            assert_eq!(c.round, Round::Detection);
        }
    }

    #[test]
    fn test_marking_round_only_set_bits() {
        let id = IdentityId::from("a");
        let value = Fingerprint::from_positions([1, 4]);
        let challenges = marking_round(&manifest(6), &id, value).unwrap();
        let ids: Vec<usize> = challenges.iter().map(|c| c.probe_id).collect();
        assert_eq!(ids, vec![1, 4]);
        assert!(challenges.iter().all(|c| c.force_refetch && c.round == Round::Marking));
        assert_eq!(challenges[1].url, "http://cdn/4");
        assert_eq!(challenges[1].to_message().hash, "digest-4");
    }

    #[test]
    fn test_content_errors_propagate() {
        let id = IdentityId::from("a");
        assert!(detection_round(&Unavailable, &id, "x").is_err());
        assert!(marking_round(&Unavailable, &id, Fingerprint::from_bits(1)).is_err());
        assert!(marking_round(&Unavailable, &id, Fingerprint::UNSEEN).unwrap().is_empty());
    }

    #[test]
    fn test_issue_all_stops_on_first_error() {
        let id = IdentityId::from("a");
        let challenges = detection_round(&manifest(3), &id, "x").unwrap();

        let mut sink = MockChallengeSink::new();
        let mut calls = 0;
        sink.expect_issue_challenge().times(2).returning(move |_| {
            calls += 1;
            if calls == 2 {
                Err(CacheMarkError::transport("closed"))
            } else {
                Ok(())
            }
        });
        assert!(issue_all(&sink, &challenges).is_err());
    }
}
