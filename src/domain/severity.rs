use serde::{Deserialize, Serialize};

/// Canonical severity of a log record, independent of source provider.
///
/// Providers that report an unrecognized (or no) severity map to `Unknown`;
/// normalization never fails on severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Unknown => "UNKNOWN",
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Severity::Error | Severity::Fatal)
    }

    /// GCP Cloud Logging `LogSeverity` vocabulary.
    ///
    /// `DEFAULT` means "no severity assigned" and maps to `Unknown`.
    pub fn from_gcp(value: &str) -> Severity {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => Severity::Debug,
            "INFO" | "NOTICE" => Severity::Info,
            "WARNING" => Severity::Warn,
            "ERROR" => Severity::Error,
            "CRITICAL" | "ALERT" | "EMERGENCY" => Severity::Fatal,
            _ => Severity::Unknown,
        }
    }

    /// Azure Monitor severity: either the numeric `severityLevel` (0-4 as
    /// used by Application Insights) or a level string from custom tables.
    pub fn from_azure(value: &serde_json::Value) -> Severity {
        match value {
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(0) => Severity::Debug, // Verbose
                Some(1) => Severity::Info,
                Some(2) => Severity::Warn,
                Some(3) => Severity::Error,
                Some(4) => Severity::Fatal, // Critical
                _ => Severity::Unknown,
            },
            serde_json::Value::String(s) => match s.to_ascii_uppercase().as_str() {
                "VERBOSE" | "DEBUG" | "TRACE" => Severity::Debug,
                "INFORMATIONAL" | "INFORMATION" | "INFO" => Severity::Info,
                "WARNING" | "WARN" => Severity::Warn,
                "ERROR" | "ERR" => Severity::Error,
                "CRITICAL" | "FATAL" => Severity::Fatal,
                _ => Severity::Unknown,
            },
            _ => Severity::Unknown,
        }
    }

    /// CloudWatch events carry no structured severity; scan the message for
    /// a recognizable level token instead.
    pub fn from_aws_message(message: &str) -> Severity {
        let upper = message.to_ascii_uppercase();
        for token in upper.split(|c: char| !c.is_ascii_alphabetic()) {
            match token {
                "FATAL" | "CRITICAL" => return Severity::Fatal,
                "ERROR" => return Severity::Error,
                "WARN" | "WARNING" => return Severity::Warn,
                "INFO" => return Severity::Info,
                "DEBUG" | "TRACE" => return Severity::Debug,
                _ => {}
            }
        }
        Severity::Unknown
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "WARN" | "WARNING" => Ok(Severity::Warn),
            "ERROR" => Ok(Severity::Error),
            "FATAL" => Ok(Severity::Fatal),
            "UNKNOWN" => Ok(Severity::Unknown),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gcp_table_covers_full_vocabulary() {
        let cases = [
            ("DEBUG", Severity::Debug),
            ("INFO", Severity::Info),
            ("NOTICE", Severity::Info),
            ("WARNING", Severity::Warn),
            ("ERROR", Severity::Error),
            ("CRITICAL", Severity::Fatal),
            ("ALERT", Severity::Fatal),
            ("EMERGENCY", Severity::Fatal),
            ("DEFAULT", Severity::Unknown),
        ];
        for (raw, expected) in cases {
            assert_eq!(Severity::from_gcp(raw), expected, "gcp {raw}");
        }
    }

    #[test]
    fn azure_numeric_and_string_levels() {
        assert_eq!(Severity::from_azure(&json!(0)), Severity::Debug);
        assert_eq!(Severity::from_azure(&json!(3)), Severity::Error);
        assert_eq!(Severity::from_azure(&json!(4)), Severity::Fatal);
        assert_eq!(Severity::from_azure(&json!("Warning")), Severity::Warn);
        assert_eq!(Severity::from_azure(&json!("bogus")), Severity::Unknown);
        assert_eq!(Severity::from_azure(&json!(null)), Severity::Unknown);
    }

    #[test]
    fn aws_message_scan_finds_first_level_token() {
        assert_eq!(
            Severity::from_aws_message("2024-01-01 ERROR: connection refused"),
            Severity::Error
        );
        assert_eq!(
            Severity::from_aws_message("[WARN] disk usage at 91%"),
            Severity::Warn
        );
        assert_eq!(Severity::from_aws_message("fatal: out of memory"), Severity::Fatal);
        assert_eq!(Severity::from_aws_message("user logged in"), Severity::Unknown);
    }
}
