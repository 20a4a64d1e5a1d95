//! Translation of human-readable memory and CPU limits into cgroup controls

use crate::errors::ConfigError;

/// Memory limit applied when none is given, or the given one is unusable
pub const DEFAULT_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// CPU quota applied when none is given, or the given one is unusable (10%)
pub const DEFAULT_CPU_QUOTA: u64 = 10_000;

/// Scheduling period the CPU quota is measured against, in microseconds
pub const CPU_PERIOD: u64 = 100_000;

/// Parse a memory size like `64m`, `1G`, `512k` or `1048576` into bytes
///
/// An empty string means the default of 64 MiB.
pub fn parse_memory(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_MEMORY_BYTES);
    }
    let lower = trimmed.to_ascii_lowercase();
    let (digits, multiplier) = match lower.as_bytes()[lower.len() - 1] {
        b'k' => (&lower[..lower.len() - 1], 1024),
        b'm' => (&lower[..lower.len() - 1], 1024 * 1024),
        b'g' => (&lower[..lower.len() - 1], 1024 * 1024 * 1024),
        _ => (&lower[..], 1),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|value| value.checked_mul(multiplier))
        .ok_or_else(|| ConfigError::InvalidMemoryLimit(input.to_owned()))
}

/// Parse a CPU percentage like `50` or `50%` into a quota out of
/// [CPU_PERIOD]
///
/// Percentages above 100 are clamped. An empty string means the default of
/// 10%.
pub fn parse_cpu(input: &str) -> Result<u64, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_CPU_QUOTA);
    }
    let percent = trimmed
        .strip_suffix('%')
        .unwrap_or(trimmed)
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidCpuLimit(input.to_owned()))?;
    Ok(percent.min(100) * CPU_PERIOD / 100)
}

/// Numeric resource controls for one container
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpu_quota: u64,
}

impl ResourceLimits {
    /// Translate the raw user strings, substituting defaults for anything
    /// unparseable
    ///
    /// A bad limit never prevents a container from starting; it is logged
    /// and replaced.
    pub fn resolve(memory: &str, cpu: &str) -> Self {
        let memory_bytes = parse_memory(memory).unwrap_or_else(|err| {
            log::warn!("{}, using default of {} bytes", err, DEFAULT_MEMORY_BYTES);
            DEFAULT_MEMORY_BYTES
        });
        let cpu_quota = parse_cpu(cpu).unwrap_or_else(|err| {
            log::warn!("{}, using default quota of {}", err, DEFAULT_CPU_QUOTA);
            DEFAULT_CPU_QUOTA
        });
        ResourceLimits {
            memory_bytes,
            cpu_quota,
        }
    }

    /// Contents for a cgroup v2 `cpu.max` file
    pub fn cpu_max(&self) -> String {
        format!("{} {}", self.cpu_quota, CPU_PERIOD)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cpu_quota: DEFAULT_CPU_QUOTA,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory() {
        assert_eq!(parse_memory("64m"), Ok(67108864));
        assert_eq!(parse_memory("1g"), Ok(1073741824));
        assert_eq!(parse_memory("1G"), Ok(1073741824));
        assert_eq!(parse_memory("512k"), Ok(524288));
        assert_eq!(parse_memory("4096"), Ok(4096));
        assert_eq!(parse_memory(""), Ok(67108864));
        assert!(parse_memory("bad").is_err());
        assert!(parse_memory("m").is_err());
        assert!(parse_memory("-5m").is_err());
        assert!(parse_memory("12q").is_err());
        assert!(parse_memory("99999999999999999999g").is_err());
        assert!(parse_memory("18446744073709551615k").is_err());
    }

    #[test]
    fn cpu() {
        assert_eq!(parse_cpu("50"), Ok(50000));
        assert_eq!(parse_cpu("50%"), Ok(50000));
        assert_eq!(parse_cpu("150"), Ok(100000));
        assert_eq!(parse_cpu("0"), Ok(0));
        assert_eq!(parse_cpu(""), Ok(10000));
        assert!(parse_cpu("half").is_err());
        assert!(parse_cpu("-1").is_err());
    }

    #[test]
    fn resolve_substitutes_defaults() {
        assert_eq!(
            ResourceLimits::resolve("128m", "20"),
            ResourceLimits {
                memory_bytes: 128 * 1024 * 1024,
                cpu_quota: 20000
            }
        );
        assert_eq!(
            ResourceLimits::resolve("lots", "most"),
            ResourceLimits::default()
        );
        assert_eq!(ResourceLimits::resolve("1g", "25").cpu_max(), "25000 100000");
    }
}
