/// Reload configuration.
#[derive(Debug, Clone)]
pub struct ReloadFlags {
    /// Emit per-phase reload diagnostics.
    pub trace_reload: bool,
    /// Assert that every new class matches an old class and that class and
    /// library counts are unchanged across the reload.
    pub identity_reload: bool,
    /// Dev-mode trigger: reload every N stack-overflow checks (0 = off).
    pub reload_every: u64,
    /// Restrict the dev-mode trigger to frames running optimized code.
    pub reload_every_optimized: bool,
}

impl Default for ReloadFlags {
    fn default() -> Self {
        Self {
            trace_reload: false,
            identity_reload: false,
            reload_every: 0,
            reload_every_optimized: true,
        }
    }
}
