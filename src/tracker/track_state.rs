/// Lifecycle state of a track identity in the query pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackState {
    /// Matched in the last frame and carried into the next one
    #[default]
    Tracked,
    /// Unmatched but still inside the grace period
    Lost,
    /// Split into two daughter identities
    Divided,
    /// Retired from tracking
    Removed,
}

impl TrackState {
    /// Whether the identity is still fed to the decoder.
    pub fn is_active(self) -> bool {
        matches!(self, TrackState::Tracked | TrackState::Lost)
    }
}
