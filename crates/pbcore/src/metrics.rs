/// Event counters for a dispatcher instance.
///
/// A dispatcher is single-threaded, so these are plain integers; reading
/// them costs a copy of the struct.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchMetrics {
    /// Total events routed through the dispatcher since construction.
    pub events: u64,
    /// Delegations accepted (frames pushed).
    pub delegations: u64,
    /// High-water mark of simultaneously live frames.
    pub peak_frames: usize,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}
