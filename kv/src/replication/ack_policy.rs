//! The release condition `notify_stream_ack` applies once an acked position
//! reaches a closed group's end stream position.
//!
//! Today that condition is "the first ack past the watermark" -- single
//! replica, no quorum. Multi-replica quorum is a reserved, unimplemented
//! extension point; the release condition is left pluggable rather than
//! hardcoded, and this trait is that plug point. `FirstAckPolicy` is the
//! only implementation shipped here.

/// Decides whether an acked stream position is enough to release a group
/// waiting at `required_position`.
pub trait AckPolicy: Send + Sync {
    fn is_satisfied(&self, acked_position: u64, required_position: u64) -> bool;
}

/// Releases as soon as a single ack reaches or passes `required_position`.
/// The only policy this crate ships; a quorum policy (majority of N
/// replicas acked past the position) would implement the same trait but
/// needs per-replica ack tracking this crate doesn't do, since it only
/// models a single master control channel's aggregate stream-ack sink.
pub struct FirstAckPolicy;

impl AckPolicy for FirstAckPolicy {
    fn is_satisfied(&self, acked_position: u64, required_position: u64) -> bool {
        acked_position >= required_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_ack_policy_requires_position_at_or_past_watermark() {
        let policy = FirstAckPolicy;
        assert!(!policy.is_satisfied(9, 10));
        assert!(policy.is_satisfied(10, 10));
        assert!(policy.is_satisfied(11, 10));
    }
}
