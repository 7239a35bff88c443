///
/// Event loop construction options.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Upper bound on readiness events accepted from one kernel wait.
    /// A full batch simply means the next wait returns immediately with the
    /// remainder, so this trades a little latency against stack space.
    ///
    /// **[default]**: 1024.
    pub event_batch: usize,

    /// Pre-sized capacity of the descriptor table. The table grows on demand
    /// to the largest watched fd, so this is purely an allocation hint for
    /// callers that know their fd ceiling up front.
    ///
    /// **[default]**: 0, grow on demand.
    pub fd_table_hint: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { event_batch: 1024, fd_table_hint: 0 }
    }
}
