//! Build and protocol version reporting

use std::fmt;

use crate::protocol::PROTOCOL_VERSION;

/// Details captured by the build script
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    git_dirty: &'static str,
    pub built_at: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
    pub rustc: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("SYNCDECK_GIT_HASH"),
            git_branch: env!("SYNCDECK_GIT_BRANCH"),
            git_dirty: env!("SYNCDECK_GIT_DIRTY"),
            built_at: env!("SYNCDECK_BUILD_TIMESTAMP"),
            target: env!("SYNCDECK_TARGET"),
            profile: env!("SYNCDECK_PROFILE"),
            rustc: env!("SYNCDECK_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty == "true"
    }

    /// Package version with commit, e.g. `0.1.0+abc1234-dirty`
    pub fn full_version(&self) -> String {
        let mut version = format!("{}+{}", self.version, self.git_hash);
        if self.git_dirty() {
            version.push_str("-dirty");
        }
        version
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "  Protocol:   {}", PROTOCOL_VERSION)?;
        writeln!(f, "  Branch:     {}", self.git_branch)?;
        writeln!(f, "  Built:      {} ({})", self.built_at, self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Host:       {}", host_name())?;
        writeln!(f, "  Compiler:   {}", self.rustc)
    }
}

/// Name of the machine this binary is running on
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn print_version() {
    print!("{}", BuildInfo::current());
}
