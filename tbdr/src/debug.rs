//! Diagnostics switches.
//!
//! Diagnostics are a plain value built once by the embedder (usually from the `TBDR_DEBUG`
//! environment variable) and stored in the [`Device`](crate::Device). Everything that needs to
//! consult them reaches them through the device it was created from.
use bitflags::bitflags;
use tracing::warn;

/// Name of the environment variable read by [`Diagnostics::from_env`].
pub const DIAGNOSTICS_ENV_VAR: &str = "TBDR_DEBUG";

bitflags! {
    /// Diagnostics flags.
    #[derive(Default)]
    pub struct Diagnostics: u32 {
        /// Zero control stream words that were moved to a new block during relocation, and keep
        /// baked streams readable for dumping.
        const DUMP_CONTROL_STREAM = 1 << 0;
        /// Track relocation mark transitions even in release builds.
        const TRACK_RELOCATION_MARKS = 1 << 1;
        /// Log every job descriptor handed to the transport as JSON.
        const DUMP_JOBS = 1 << 2;
        /// Zero-fill every device allocation on creation.
        const ZERO_ALLOCATIONS = 1 << 3;
        /// Log every device allocation and free.
        const TRACK_ALLOCATIONS = 1 << 4;
    }
}

impl Diagnostics {
    /// Parses a comma-separated list of flag names (`cs`, `marks`, `jobs`, `zero`, `allocs`,
    /// or `all`). Unknown names are ignored with a warning.
    pub fn parse(s: &str) -> Diagnostics {
        let mut flags = Diagnostics::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "cs" | "dump_cs" => flags |= Diagnostics::DUMP_CONTROL_STREAM,
                "marks" => flags |= Diagnostics::TRACK_RELOCATION_MARKS,
                "jobs" | "dump_jobs" => flags |= Diagnostics::DUMP_JOBS,
                "zero" | "zero_bos" => flags |= Diagnostics::ZERO_ALLOCATIONS,
                "allocs" | "track_bos" => flags |= Diagnostics::TRACK_ALLOCATIONS,
                "all" => flags = Diagnostics::all(),
                other => warn!(flag = other, "unknown diagnostics flag"),
            }
        }
        flags
    }

    /// Reads the flags from the environment.
    pub fn from_env() -> Diagnostics {
        std::env::var(DIAGNOSTICS_ENV_VAR)
            .map(|v| Diagnostics::parse(&v))
            .unwrap_or_default()
    }

    /// Whether relocation mark transitions should be validated.
    pub(crate) fn track_relocation_marks(&self) -> bool {
        cfg!(debug_assertions) || self.contains(Diagnostics::TRACK_RELOCATION_MARKS)
    }
}
