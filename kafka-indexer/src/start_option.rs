use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::error::StartOptionError;
use crate::kafka::types::{PartitionId, ALL_PARTITIONS};
use crate::metrics_const::START_OPTION_FALLBACK_COUNTER;

// One `partition=offset` pair per data line, both plain non-negative integers.
// ASCII digits only; `\d` would also accept other scripts' digits.
static OVERRIDE_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)=([0-9]+)$").unwrap());

/// Where a newly assigned partition begins reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartFrom {
    /// Last committed position, or the log start when nothing was committed
    Restart,
    /// Oldest retained offset
    Earliest,
    /// End of the log, skipping retained data
    Latest,
    /// Explicit absolute offset
    Custom(i64),
}

impl StartFrom {
    pub fn label(&self) -> &'static str {
        match self {
            StartFrom::Restart => "restart",
            StartFrom::Earliest => "earliest",
            StartFrom::Latest => "latest",
            StartFrom::Custom(_) => "custom",
        }
    }
}

impl fmt::Display for StartFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartFrom::Restart => write!(f, "RESTART"),
            StartFrom::Earliest => write!(f, "EARLIEST"),
            StartFrom::Latest => write!(f, "LATEST"),
            StartFrom::Custom(offset) => write!(f, "CUSTOM:{offset}"),
        }
    }
}

/// Start directive per partition, with `ALL_PARTITIONS` as the catch-all.
///
/// Built once at startup and shared read-only by every consumer instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptionMap {
    entries: BTreeMap<PartitionId, StartFrom>,
}

impl StartOptionMap {
    /// Empty map; every lookup yields `Restart`
    pub fn new() -> Self {
        Self::default()
    }

    /// `{ALL_PARTITIONS: Restart}`, used whenever resolution degrades
    pub fn restart_default() -> Self {
        Self::all_partitions(StartFrom::Restart)
    }

    pub fn all_partitions(start: StartFrom) -> Self {
        Self {
            entries: BTreeMap::from([(ALL_PARTITIONS, start)]),
        }
    }

    /// Later entries for the same partition replace earlier ones.
    pub fn from_entries(entries: impl IntoIterator<Item = (PartitionId, StartFrom)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Explicit entry for `partition`, without fallback
    pub fn get(&self, partition: PartitionId) -> Option<StartFrom> {
        self.entries.get(&partition).copied()
    }

    /// Directive for `partition`: its own entry, else the `ALL_PARTITIONS`
    /// entry, else `Restart`.
    pub fn directive_for(&self, partition: PartitionId) -> StartFrom {
        self.get(partition)
            .or_else(|| self.get(ALL_PARTITIONS))
            .unwrap_or(StartFrom::Restart)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to do when `CUSTOM` is requested but no override file can be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingOverridePolicy {
    /// Warn and start every partition with `Restart`
    #[default]
    FallbackToRestart,
    /// Refuse to start
    Reject,
}

impl MissingOverridePolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            MissingOverridePolicy::Reject
        } else {
            MissingOverridePolicy::FallbackToRestart
        }
    }
}

/// Result of start option resolution.
#[derive(Debug)]
pub struct ResolvedStartOptions {
    pub options: StartOptionMap,
    /// Set when the configured directive could not be honoured and the
    /// restart default was used instead
    pub fallback_cause: Option<StartOptionError>,
}

impl ResolvedStartOptions {
    fn exact(options: StartOptionMap) -> Self {
        Self {
            options,
            fallback_cause: None,
        }
    }

    fn fallback(cause: StartOptionError) -> Self {
        warn!("Falling back to RESTART for all partitions: {cause:#}");
        metrics::counter!(START_OPTION_FALLBACK_COUNTER, "reason" => fallback_reason(&cause))
            .increment(1);
        Self {
            options: StartOptionMap::restart_default(),
            fallback_cause: Some(cause),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_cause.is_some()
    }
}

fn fallback_reason(cause: &StartOptionError) -> &'static str {
    match cause {
        StartOptionError::Parse { .. } => "parse",
        StartOptionError::MissingOverrideSource { .. } => "missing_override",
        StartOptionError::Io { .. } => "io",
    }
}

enum Directive {
    Unset,
    Uniform(StartFrom),
    OverrideFile,
}

fn parse_directive(raw: &str) -> Result<Directive, StartOptionError> {
    let token = raw.trim().to_ascii_uppercase();
    if token.is_empty() {
        return Ok(Directive::Unset);
    }

    match token.as_str() {
        "RESTART" => Ok(Directive::Uniform(StartFrom::Restart)),
        "EARLIEST" => Ok(Directive::Uniform(StartFrom::Earliest)),
        "LATEST" => Ok(Directive::Uniform(StartFrom::Latest)),
        "CUSTOM" => Ok(Directive::OverrideFile),
        _ => match token.strip_prefix("CUSTOM:") {
            Some(offset) => parse_offset(offset.trim())
                .map(|o| Directive::Uniform(StartFrom::Custom(o)))
                .ok_or_else(|| {
                    StartOptionError::parse(format!(
                        "'{}' is not a valid custom offset",
                        raw.trim()
                    ))
                }),
            None => Err(StartOptionError::parse(format!(
                "unrecognized start option '{}', expected one of RESTART, EARLIEST, LATEST, CUSTOM or CUSTOM:<offset>",
                raw.trim()
            ))),
        },
    }
}

fn parse_offset(value: &str) -> Option<i64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<i64>().ok()
}

/// Parse the whole override file. Any bad line rejects the file.
fn parse_override_file(content: &str) -> Result<StartOptionMap, StartOptionError> {
    let mut entries = BTreeMap::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line_no = idx + 1;
        let captures = OVERRIDE_LINE_REGEX.captures(line).ok_or_else(|| {
            StartOptionError::parse(format!(
                "line {line_no}: expected '<partition>=<offset>', got '{line}'"
            ))
        })?;

        let partition: PartitionId = captures[1].parse().map_err(|_| {
            StartOptionError::parse(format!("line {line_no}: partition id out of range"))
        })?;
        let offset: i64 = captures[2].parse().map_err(|_| {
            StartOptionError::parse(format!("line {line_no}: offset out of range"))
        })?;

        match entries.entry(partition) {
            Entry::Vacant(slot) => {
                slot.insert(StartFrom::Custom(offset));
            }
            Entry::Occupied(_) => {
                return Err(StartOptionError::parse(format!(
                    "line {line_no}: partition {partition} listed more than once"
                )));
            }
        }
    }

    Ok(StartOptionMap { entries })
}

fn missing(path: Option<&Path>) -> StartOptionError {
    StartOptionError::MissingOverrideSource {
        path: path.map(Path::to_path_buf),
    }
}

fn resolve_override_file(
    override_path: Option<&Path>,
    policy: MissingOverridePolicy,
) -> Result<ResolvedStartOptions, StartOptionError> {
    let Some(path) = override_path else {
        return match policy {
            MissingOverridePolicy::Reject => Err(missing(None)),
            MissingOverridePolicy::FallbackToRestart => {
                Ok(ResolvedStartOptions::fallback(missing(None)))
            }
        };
    };

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return match policy {
                MissingOverridePolicy::Reject => Err(missing(Some(path))),
                MissingOverridePolicy::FallbackToRestart => {
                    Ok(ResolvedStartOptions::fallback(missing(Some(path))))
                }
            };
        }
        Err(source) => {
            return Err(StartOptionError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let parsed = String::from_utf8(bytes)
        .map_err(|_| StartOptionError::parse("override file is not valid UTF-8"))
        .and_then(|content| parse_override_file(&content));

    match parsed {
        Ok(options) if options.is_empty() => {
            info!(
                path = %path.display(),
                "Override file has no entries, using RESTART for all partitions"
            );
            Ok(ResolvedStartOptions::exact(StartOptionMap::restart_default()))
        }
        Ok(options) => Ok(ResolvedStartOptions::exact(options)),
        Err(e) => Ok(ResolvedStartOptions::fallback(e)),
    }
}

/// Resolve the operator's start directive into a per-partition map.
///
/// Malformed input degrades to [`StartOptionMap::restart_default`] with the
/// cause recorded. Only an unreadable override file, or a missing one under
/// [`MissingOverridePolicy::Reject`], is returned as an error.
pub fn resolve(
    directive: Option<&str>,
    override_path: Option<&Path>,
    policy: MissingOverridePolicy,
) -> Result<ResolvedStartOptions, StartOptionError> {
    let resolved = match parse_directive(directive.unwrap_or_default()) {
        Ok(Directive::Unset) => ResolvedStartOptions::exact(StartOptionMap::new()),
        Ok(Directive::Uniform(start)) => {
            ResolvedStartOptions::exact(StartOptionMap::all_partitions(start))
        }
        Ok(Directive::OverrideFile) => resolve_override_file(override_path, policy)?,
        Err(e) => ResolvedStartOptions::fallback(e),
    };

    info!(
        entries = resolved.options.len(),
        fallback = resolved.is_fallback(),
        options = ?resolved.options,
        "Resolved consumer start options"
    );

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};
    use test_case::test_case;

    fn override_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn resolve_default(directive: &str) -> ResolvedStartOptions {
        resolve(Some(directive), None, MissingOverridePolicy::default()).unwrap()
    }

    #[test]
    fn test_lookup_falls_back_to_all_partitions_then_restart() {
        let map = StartOptionMap::from_entries([
            (ALL_PARTITIONS, StartFrom::Latest),
            (3, StartFrom::Custom(42)),
        ]);
        assert_eq!(map.directive_for(3), StartFrom::Custom(42));
        assert_eq!(map.directive_for(0), StartFrom::Latest);

        let sparse = StartOptionMap::from_entries([(3, StartFrom::Custom(42))]);
        assert_eq!(sparse.directive_for(0), StartFrom::Restart);
        assert_eq!(StartOptionMap::new().directive_for(9), StartFrom::Restart);
    }

    #[test_case("RESTART", StartFrom::Restart ; "restart")]
    #[test_case("EARLIEST", StartFrom::Earliest ; "earliest")]
    #[test_case("LATEST", StartFrom::Latest ; "latest")]
    #[test_case("CUSTOM:222", StartFrom::Custom(222) ; "custom with offset")]
    #[test_case("  latest ", StartFrom::Latest ; "lowercase with whitespace")]
    #[test_case("custom:0", StartFrom::Custom(0) ; "lowercase custom zero")]
    fn test_uniform_directive_yields_single_entry(directive: &str, expected: StartFrom) {
        let resolved = resolve_default(directive);

        assert!(resolved.fallback_cause.is_none());
        assert_eq!(resolved.options.len(), 1);
        assert_eq!(resolved.options.get(ALL_PARTITIONS), Some(expected));
    }

    #[test]
    fn test_unset_directive_is_empty_map() {
        let resolved = resolve(None, None, MissingOverridePolicy::default()).unwrap();
        assert!(resolved.options.is_empty());
        assert!(resolved.fallback_cause.is_none());

        let blank = resolve_default("   ");
        assert!(blank.options.is_empty());
    }

    #[test_case("BEGINNING" ; "unknown token")]
    #[test_case("CUSTOM:abc" ; "non numeric offset")]
    #[test_case("CUSTOM:-5" ; "negative offset")]
    #[test_case("CUSTOM:" ; "missing offset")]
    #[test_case("CUSTOM:99999999999999999999" ; "offset overflow")]
    fn test_unrecognized_directive_falls_back_with_cause(directive: &str) {
        let resolved = resolve_default(directive);

        assert_eq!(resolved.options, StartOptionMap::restart_default());
        assert!(matches!(
            resolved.fallback_cause,
            Some(StartOptionError::Parse { .. })
        ));
    }

    #[test]
    fn test_override_file_entries() {
        let file = override_file("0=10\n1=20");

        let resolved = resolve(
            Some("CUSTOM"),
            Some(file.path()),
            MissingOverridePolicy::default(),
        )
        .unwrap();

        assert!(resolved.fallback_cause.is_none());
        assert_eq!(
            resolved.options,
            StartOptionMap::from_entries([(0, StartFrom::Custom(10)), (1, StartFrom::Custom(20))])
        );
        // Unlisted partitions restart
        assert_eq!(resolved.options.directive_for(2), StartFrom::Restart);
    }

    #[test]
    fn test_override_file_skips_comments_and_blank_lines() {
        let file = override_file("# replay after incident\n\n  4=1000  \n   # trailing\n7=0\n");

        let resolved = resolve(
            Some("custom"),
            Some(file.path()),
            MissingOverridePolicy::default(),
        )
        .unwrap();

        assert_eq!(
            resolved.options,
            StartOptionMap::from_entries([(4, StartFrom::Custom(1000)), (7, StartFrom::Custom(0))])
        );
    }

    #[test_case("0=10\nbogus\n1=20" ; "malformed line")]
    #[test_case("0=10\n1=-20" ; "negative offset")]
    #[test_case("0 = 10" ; "spaces around separator")]
    #[test_case("0=10\n0=11" ; "duplicate partition")]
    #[test_case("99999999999=1" ; "partition overflow")]
    fn test_malformed_override_file_discards_everything(content: &str) {
        let file = override_file(content);

        let resolved = resolve(
            Some("CUSTOM"),
            Some(file.path()),
            MissingOverridePolicy::default(),
        )
        .unwrap();

        assert_eq!(resolved.options, StartOptionMap::restart_default());
        assert!(matches!(
            resolved.fallback_cause,
            Some(StartOptionError::Parse { .. })
        ));
    }

    #[test_case("\u{0663}=10" ; "arabic indic partition")]
    #[test_case("3=\u{0661}\u{0660}" ; "arabic indic offset")]
    #[test_case("\u{FF13}=10" ; "fullwidth digit")]
    fn test_non_ascii_digits_are_rejected_as_malformed(content: &str) {
        let file = override_file(content);

        let resolved = resolve(
            Some("CUSTOM"),
            Some(file.path()),
            MissingOverridePolicy::default(),
        )
        .unwrap();

        assert_eq!(resolved.options, StartOptionMap::restart_default());
        match resolved.fallback_cause {
            Some(StartOptionError::Parse { reason }) => {
                assert!(reason.contains("expected '<partition>=<offset>'"), "{reason}");
            }
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[test_case("" ; "zero bytes")]
    #[test_case("# only comments\n\n   \n" ; "comments only")]
    fn test_empty_override_file_yields_default(content: &str) {
        let file = override_file(content);

        let resolved = resolve(
            Some("CUSTOM"),
            Some(file.path()),
            MissingOverridePolicy::Reject,
        )
        .unwrap();

        assert_eq!(resolved.options, StartOptionMap::restart_default());
        assert!(resolved.fallback_cause.is_none());
    }

    #[test]
    fn test_non_utf8_override_file_is_a_parse_failure() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x30, 0x3d, 0xff, 0xfe]).unwrap();
        file.flush().unwrap();

        let resolved = resolve(
            Some("CUSTOM"),
            Some(file.path()),
            MissingOverridePolicy::default(),
        )
        .unwrap();

        assert_eq!(resolved.options, StartOptionMap::restart_default());
        assert!(matches!(
            resolved.fallback_cause,
            Some(StartOptionError::Parse { .. })
        ));
    }

    #[test]
    fn test_bare_custom_without_path_falls_back() {
        let resolved = resolve(
            Some("CUSTOM"),
            None,
            MissingOverridePolicy::FallbackToRestart,
        )
        .unwrap();

        assert_eq!(resolved.options, StartOptionMap::restart_default());
        assert!(matches!(
            resolved.fallback_cause,
            Some(StartOptionError::MissingOverrideSource { path: None })
        ));
    }

    #[test]
    fn test_bare_custom_without_path_rejected_when_strict() {
        let err = resolve(Some("CUSTOM"), None, MissingOverridePolicy::Reject).unwrap_err();
        assert!(matches!(
            err,
            StartOptionError::MissingOverrideSource { path: None }
        ));
    }

    #[test]
    fn test_missing_override_file_follows_policy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("does-not-exist.config");

        let lenient = resolve(
            Some("CUSTOM"),
            Some(&path),
            MissingOverridePolicy::FallbackToRestart,
        )
        .unwrap();
        assert_eq!(lenient.options, StartOptionMap::restart_default());
        assert!(matches!(
            lenient.fallback_cause,
            Some(StartOptionError::MissingOverrideSource { path: Some(_) })
        ));

        let strict = resolve(Some("CUSTOM"), Some(&path), MissingOverridePolicy::Reject);
        assert!(matches!(
            strict,
            Err(StartOptionError::MissingOverrideSource { path: Some(_) })
        ));
    }

    #[test]
    fn test_unreadable_override_path_is_fatal() {
        let dir = TempDir::new().unwrap();

        let err = resolve(
            Some("CUSTOM"),
            Some(dir.path()),
            MissingOverridePolicy::FallbackToRestart,
        )
        .unwrap_err();

        assert!(matches!(err, StartOptionError::Io { .. }));
    }

    #[test]
    fn test_override_path_ignored_for_uniform_directives() {
        let file = override_file("0=10");

        let resolved = resolve(
            Some("LATEST"),
            Some(file.path()),
            MissingOverridePolicy::default(),
        )
        .unwrap();

        assert_eq!(resolved.options, StartOptionMap::all_partitions(StartFrom::Latest));
    }

    #[test]
    fn test_directive_display_round_trips_through_parser() {
        for start in [
            StartFrom::Restart,
            StartFrom::Earliest,
            StartFrom::Latest,
            StartFrom::Custom(17),
        ] {
            let resolved = resolve_default(&start.to_string());
            assert_eq!(resolved.options.get(ALL_PARTITIONS), Some(start));
        }
    }

    #[test]
    fn test_policy_from_strict_flag() {
        assert_eq!(
            MissingOverridePolicy::from_strict(true),
            MissingOverridePolicy::Reject
        );
        assert_eq!(
            MissingOverridePolicy::from_strict(false),
            MissingOverridePolicy::FallbackToRestart
        );
    }
}
