//! Script-header directive extraction.
//!
//! Directives are `# NAME: value` comment lines at the top of a job
//! script, after an optional shebang. Names are case-sensitive; the first
//! line that is not a recognized directive (including ordinary comments)
//! ends the header, and everything from there on is the script body.

use std::time::Duration;

use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use wjm_core::record::{JobSpec, Priority};
use wjm_core::spec::{CpuSpec, GpuSpec, MemorySpec, RetryOn};
use wjm_core::Config;

use crate::duration::parse_duration;

static DIRECTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^# ([A-Z_]+): (.*)$").unwrap());

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {directive} directive '{value}': {rule}")]
pub struct DirectiveError {
    pub directive: &'static str,
    pub value: String,
    pub rule: String,
}

fn directive_error(
    directive: &'static str,
    value: &str,
    rule: impl ToString,
) -> DirectiveError {
    DirectiveError {
        directive,
        value: value.to_string(),
        rule: rule.to_string(),
    }
}

/// Directive values extracted from a script header. `None` means the
/// directive was absent; defaults are applied later, at the submission
/// boundary, after presets and CLI flags are merged in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    pub weight: Option<u32>,
    pub gpu: Option<GpuSpec>,
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub retry_max: Option<u8>,
    pub retry_delay: Option<Duration>,
    pub retry_on: Option<RetryOn>,
    pub cpu: Option<CpuSpec>,
    pub memory: Option<MemorySpec>,
    pub project: Option<String>,
    pub group: Option<String>,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub on_fail: Option<String>,
    pub on_success: Option<String>,
}

impl Directives {
    /// Overlay `other` on top of self: any directive set in `other` wins.
    /// This is how preset < directive < CLI-flag precedence is built.
    pub fn overlay(mut self, other: Directives) -> Directives {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            weight, gpu, priority, timeout, retry_max, retry_delay, retry_on, cpu, memory,
            project, group, pre_hook, post_hook, on_fail, on_success
        );
        self
    }

    /// Fill the remaining gaps from config defaults and produce a
    /// submission spec.
    pub fn into_spec(self, config: &Config, script_name: String, body: String) -> JobSpec {
        JobSpec {
            body,
            script_name,
            name: None,
            weight: self.weight.unwrap_or(config.default_job_weight),
            gpu: self.gpu.unwrap_or_default(),
            cpu: self.cpu.unwrap_or_default(),
            memory: self.memory.unwrap_or_default(),
            priority: self.priority.unwrap_or(config.default_job_priority),
            timeout: self.timeout,
            dependencies: Vec::new(),
            retry_max: self.retry_max.unwrap_or(0),
            retry_delay: self.retry_delay.unwrap_or(Duration::from_secs(60)),
            retry_on: self.retry_on.unwrap_or_default(),
            pre_hook: self.pre_hook,
            post_hook: self.post_hook,
            on_fail: self.on_fail,
            on_success: self.on_success,
            project: self.project,
            group: self.group,
            array: None,
        }
    }
}

/// Render a spec back into job-file form: optional shebang, directive
/// header, body. This is what queue entries and resubmit store, so a
/// re-parse reproduces the same spec.
pub fn render_script(spec: &JobSpec) -> String {
    let mut out = String::new();
    let mut body = spec.body.as_str();
    if body.starts_with("#!") {
        let (shebang, rest) = body.split_once('\n').unwrap_or((body, ""));
        let _ = writeln!(out, "{shebang}");
        body = rest;
    }

    let _ = writeln!(out, "# WEIGHT: {}", spec.weight);
    if spec.gpu != GpuSpec::None {
        let _ = writeln!(out, "# GPU: {}", spec.gpu.to_field());
    }
    let _ = writeln!(out, "# PRIORITY: {}", spec.priority);
    if let Some(timeout) = spec.timeout {
        let _ = writeln!(out, "# TIMEOUT: {}s", timeout.as_secs());
    }
    if spec.retry_max > 0 {
        let _ = writeln!(out, "# RETRY: {}", spec.retry_max);
        let _ = writeln!(out, "# RETRY_DELAY: {}", spec.retry_delay.as_secs());
        if let RetryOn::Codes(_) = spec.retry_on {
            let _ = writeln!(out, "# RETRY_ON: {}", spec.retry_on.to_field());
        }
    }
    if spec.cpu != CpuSpec::None {
        let _ = writeln!(out, "# CPU: {}", spec.cpu.to_field());
    }
    if spec.memory != MemorySpec::None {
        let _ = writeln!(out, "# MEMORY: {}", spec.memory.to_field());
    }
    if let Some(project) = &spec.project {
        let _ = writeln!(out, "# PROJECT: {project}");
    }
    if let Some(group) = &spec.group {
        let _ = writeln!(out, "# GROUP: {group}");
    }
    if let Some(hook) = &spec.pre_hook {
        let _ = writeln!(out, "# PRE_HOOK: {hook}");
    }
    if let Some(hook) = &spec.post_hook {
        let _ = writeln!(out, "# POST_HOOK: {hook}");
    }
    if let Some(hook) = &spec.on_fail {
        let _ = writeln!(out, "# ON_FAIL: {hook}");
    }
    if let Some(hook) = &spec.on_success {
        let _ = writeln!(out, "# ON_SUCCESS: {hook}");
    }
    out.push_str(body);
    out
}

/// A script split into its directives and metadata-stripped body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScript {
    pub directives: Directives,
    /// The executable body: the shebang (if any) plus everything after
    /// the directive header.
    pub body: String,
}

/// Project/group identifiers: at most 50 chars, no separators that could
/// escape into paths or records, no control characters.
fn validate_identifier(directive: &'static str, value: &str) -> Result<String, DirectiveError> {
    if value.is_empty() || value.len() > 50 {
        return Err(directive_error(directive, value, "must be 1..=50 characters"));
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '=' || c.is_control())
    {
        return Err(directive_error(
            directive,
            value,
            "must not contain '/', '=', or control characters",
        ));
    }
    Ok(value.to_string())
}

pub fn parse_script(text: &str) -> Result<ParsedScript, DirectiveError> {
    let mut directives = Directives::default();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut in_header = true;

    for (idx, line) in text.lines().enumerate() {
        if in_header {
            if idx == 0 && line.starts_with("#!") {
                body_lines.push(line);
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            if let Some(caps) = DIRECTIVE_RE.captures(line) {
                let name = caps.get(1).unwrap().as_str();
                let value = caps.get(2).unwrap().as_str().trim();
                if apply_directive(&mut directives, name, value)? {
                    continue;
                }
            }
            // First non-directive line: the header is over.
            in_header = false;
        }
        body_lines.push(line);
    }

    let mut body = body_lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok(ParsedScript { directives, body })
}

/// Apply one recognized directive; returns false for unknown names, which
/// terminate the header.
fn apply_directive(
    directives: &mut Directives,
    name: &str,
    value: &str,
) -> Result<bool, DirectiveError> {
    match name {
        "WEIGHT" => {
            let weight: u32 = value
                .parse()
                .map_err(|_| directive_error("WEIGHT", value, "must be an integer"))?;
            if weight == 0 || weight > 1000 {
                return Err(directive_error("WEIGHT", value, "must be 1..=1000"));
            }
            directives.weight = Some(weight);
        }
        "GPU" => {
            directives.gpu = Some(
                value
                    .parse()
                    .map_err(|e| directive_error("GPU", value, e))?,
            );
        }
        "PRIORITY" => {
            directives.priority = Some(
                value
                    .parse()
                    .map_err(|e| directive_error("PRIORITY", value, e))?,
            );
        }
        "TIMEOUT" => {
            directives.timeout =
                Some(parse_duration(value).map_err(|e| directive_error("TIMEOUT", value, e))?);
        }
        "RETRY" => {
            let retries: u8 = value
                .parse()
                .map_err(|_| directive_error("RETRY", value, "must be an integer"))?;
            if retries > 10 {
                return Err(directive_error("RETRY", value, "must be 0..=10"));
            }
            directives.retry_max = Some(retries);
        }
        "RETRY_DELAY" => {
            let secs: u64 = value.parse().map_err(|_| {
                directive_error("RETRY_DELAY", value, "must be seconds as an integer")
            })?;
            directives.retry_delay = Some(Duration::from_secs(secs));
        }
        "RETRY_ON" => {
            directives.retry_on = Some(
                value
                    .parse()
                    .map_err(|e| directive_error("RETRY_ON", value, e))?,
            );
        }
        "CPU" | "CORES" => {
            directives.cpu = Some(
                value
                    .parse()
                    .map_err(|e| directive_error("CPU", value, e))?,
            );
        }
        "MEMORY" => {
            directives.memory = Some(
                value
                    .parse()
                    .map_err(|e| directive_error("MEMORY", value, e))?,
            );
        }
        "PROJECT" => directives.project = Some(validate_identifier("PROJECT", value)?),
        "GROUP" => directives.group = Some(validate_identifier("GROUP", value)?),
        "PRE_HOOK" => directives.pre_hook = Some(value.to_string()),
        "POST_HOOK" => directives.post_hook = Some(value.to_string()),
        "ON_FAIL" => directives.on_fail = Some(value.to_string()),
        "ON_SUCCESS" => directives.on_success = Some(value.to_string()),
        _ => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_header() {
        let script = "\
#!/bin/bash
# WEIGHT: 40
# GPU: 0,1
# PRIORITY: high
# TIMEOUT: 2h
# RETRY: 3
# RETRY_DELAY: 5
# RETRY_ON: 2,5
# CPU: 4
# MEMORY: 4G
# PROJECT: ml
# PRE_HOOK: echo start

echo training
";
        let parsed = parse_script(script).unwrap();
        let d = &parsed.directives;
        assert_eq!(d.weight, Some(40));
        assert_eq!(d.gpu, Some(GpuSpec::Ids(vec![0, 1])));
        assert_eq!(d.priority, Some(Priority::High));
        assert_eq!(d.timeout, Some(Duration::from_secs(7200)));
        assert_eq!(d.retry_max, Some(3));
        assert_eq!(d.retry_on, Some(RetryOn::Codes(vec![2, 5])));
        assert_eq!(d.cpu, Some(CpuSpec::Count(4)));
        assert_eq!(d.memory, Some(MemorySpec::Bytes(4 << 30)));
        assert_eq!(d.pre_hook.as_deref(), Some("echo start"));
        assert_eq!(parsed.body, "#!/bin/bash\necho training\n");
    }

    #[test]
    fn test_unrecognized_comment_ends_header() {
        let script = "\
# WEIGHT: 10
# just a note, not a directive
# GPU: 0
echo hi
";
        let parsed = parse_script(script).unwrap();
        assert_eq!(parsed.directives.weight, Some(10));
        // GPU came after the terminating comment, so it is body text.
        assert_eq!(parsed.directives.gpu, None);
        assert!(parsed.body.contains("# GPU: 0"));
    }

    #[test]
    fn test_case_sensitive_names() {
        let parsed = parse_script("# weight: 10\necho hi\n").unwrap();
        assert_eq!(parsed.directives.weight, None);
        assert!(parsed.body.starts_with("# weight: 10"));
    }

    #[test]
    fn test_cores_alias() {
        let parsed = parse_script("# CORES: 2-3\necho hi\n").unwrap();
        assert_eq!(parsed.directives.cpu, Some(CpuSpec::Range(2, 3)));
    }

    #[test]
    fn test_weight_out_of_range() {
        let err = parse_script("# WEIGHT: 1001\n").unwrap_err();
        assert_eq!(err.directive, "WEIGHT");
        assert!(err.rule.contains("1..=1000"));
    }

    #[test]
    fn test_group_rejects_separators() {
        assert!(parse_script("# GROUP: a/b\n").is_err());
        assert!(parse_script("# GROUP: a=b\n").is_err());
        let long = format!("# GROUP: {}\n", "x".repeat(51));
        assert!(parse_script(&long).is_err());
    }

    #[test]
    fn test_body_only_script() {
        let parsed = parse_script("echo hi\necho bye\n").unwrap();
        assert_eq!(parsed.directives, Directives::default());
        assert_eq!(parsed.body, "echo hi\necho bye\n");
    }

    #[test]
    fn test_overlay_precedence() {
        let base = Directives {
            weight: Some(10),
            priority: Some(Priority::Low),
            ..Directives::default()
        };
        let wins = Directives {
            weight: Some(99),
            gpu: Some(GpuSpec::Any),
            ..Directives::default()
        };
        let merged = base.overlay(wins);
        assert_eq!(merged.weight, Some(99));
        assert_eq!(merged.priority, Some(Priority::Low));
        assert_eq!(merged.gpu, Some(GpuSpec::Any));
    }

    #[test]
    fn test_into_spec_applies_config_defaults() {
        let config = wjm_core::Config::with_root("/tmp/x".into());
        let spec = Directives::default().into_spec(&config, "a.sh".into(), "echo\n".into());
        assert_eq!(spec.weight, config.default_job_weight);
        assert_eq!(spec.priority, config.default_job_priority);
        assert_eq!(spec.retry_max, 0);
        assert_eq!(spec.retry_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_render_parse_round_trip() {
        let config = wjm_core::Config::with_root("/tmp/x".into());
        let script = "\
#!/bin/bash
# WEIGHT: 40
# GPU: auto:2
# PRIORITY: high
# TIMEOUT: 90s
# RETRY: 2
# RETRY_DELAY: 5
# RETRY_ON: 2
# MEMORY: 1G
# GROUP: batch-a
echo run
";
        let first = parse_script(script).unwrap();
        let spec = first
            .directives
            .clone()
            .into_spec(&config, "a.sh".into(), first.body.clone());
        let rendered = render_script(&spec);
        let second = parse_script(&rendered).unwrap();
        assert_eq!(second.directives, first.directives);
        assert_eq!(second.body, first.body);
    }

    #[test]
    fn test_blank_lines_do_not_end_header() {
        let parsed = parse_script("# WEIGHT: 5\n\n# GPU: auto\necho hi\n").unwrap();
        assert_eq!(parsed.directives.weight, Some(5));
        assert_eq!(parsed.directives.gpu, Some(GpuSpec::Auto(1)));
    }
}
