//! Failure classifier
//!
//! Maps a raw step error onto one of the seven failure categories. Pure and
//! total: only the error message, the error code and step metadata are
//! inspected, never payload values.
//!
//! Evaluation order, first match wins:
//! 1. `data_shape_mismatch`
//! 2. `data_unavailable`
//! 3. `execution_error` (transient, retryable)
//! 4. `execution_error` (auth or configuration)
//! 5. `capability_mismatch`
//! 6. `invalid_step_order`
//! 7. `missing_step`
//! 8. `logic_error`
//!
//! HTTP 401 short-circuits to auth before any of the above.

use once_cell::sync::Lazy;
use regex::Regex;
use shadow_types::{
    FailureCategory, FailureClassification, FailureSubType, ParameterError, Severity,
    StepDefinition, StepError,
};

/// Step metadata visible to the classifier
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub step_id: &'a str,
    pub step_name: &'a str,
    pub step_type: Option<&'a str>,
}

impl<'a> From<&'a StepDefinition> for StepContext<'a> {
    fn from(step: &'a StepDefinition) -> Self {
        Self {
            step_id: &step.id,
            step_name: &step.name,
            step_type: step.step_type.as_deref(),
        }
    }
}

// A bare leading number only counts when a reason phrase follows it
static STATUS_IN_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*([1-5]\d{2})\s*[:\-]?\s*(?:unauthori[sz]ed|forbidden|not found|too many requests|service unavailable|gateway time-?out|bad gateway|internal server error|bad request)\b|\b(?:http|status(?:\s+code)?|error|code|response)\b[\s:=]*([1-5]\d{2})\b",
    )
    .expect("valid regex")
});

static SHAPE_MISMATCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)expected (?:an? )?array|expects an array|but (?:received|got) (?:an? )?object|must be an array|is not an array|(?:is )?not iterable|cannot iterate over|received object instead of array",
    )
    .expect("valid regex")
});

static EMPTY_RESULTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bno data\b|\bno results?\b|\bempty result|\breturned (?:no|0|zero|empty)\b|\b(?:0|zero) results\b|\bno (?:records|items|rows|entries) (?:found|returned)\b|\bmissing input data\b|\bis empty\b",
    )
    .expect("valid regex")
});

static MISSING_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bmissing required (?:field|input|property)\b|\brequired field\b.*\b(?:missing|undefined|null)\b|\bfield (?:is )?required\b",
    )
    .expect("valid regex")
});

static RATE_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)rate[\s_-]?limit|too many requests").expect("valid regex")
});

static TIMEOUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)timed out|\btime ?out\b|deadline exceeded|gateway timeout").expect("valid regex")
});

static NETWORK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)econnreset|econnrefused|etimedout|socket hang up|connection (?:reset|refused|closed)|network error",
    )
    .expect("valid regex")
});

static UNAVAILABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)service unavailable|temporarily unavailable|try again later").expect("valid regex")
});

static RECONNECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\breconnect").expect("valid regex"));

static OAUTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\boauth|\binvalid[_ ](?:token|grant|credentials?)\b|\b(?:token|session|credentials?) (?:has )?(?:been )?(?:expired|revoked|invalid)|\bexpired (?:token|credentials?)\b|\b(?:access|refresh) token\b|\binsufficient (?:scopes?|authentication)\b|\bmissing (?:required )?scopes?\b|\bscopes? (?:missing|required)\b|partner program|\bunauthori[sz]ed\b|\bunauthenticated\b|\bauthentication (?:failed|required|error)\b|\binvalid api key\b",
    )
    .expect("valid regex")
});

static FORBIDDEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\bforbidden\b|permission denied|access denied|not authori[sz]ed|does not have permission|insufficient permissions?",
    )
    .expect("valid regex")
});

static QUOTED_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[\s(:=\[,])'([^']+)'|"([^"]+)""#).expect("valid regex")
});

static RESOURCE_NOT_FOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:spreadsheet|worksheet|sheet|tab|range|column|field|file|folder|document|table|resource|channel|database|page|calendar|board|project|repository|record)\b[^.]*?\b(?:not found|does not exist)\b",
    )
    .expect("valid regex")
});

static PARAMETER_NOT_FOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(spreadsheet|range|sheet|column|field|file|folder|document|table)\s+(?:id\s+|name\s+)?['"]([^'"]+)['"]\s+(?:was\s+|is\s+)?not\s+found"#,
    )
    .expect("valid regex")
});

static CAPABILITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)does not support|doesn't support|unsupported (?:action|operation)|action not supported|is not supported|not supported by|unknown action",
    )
    .expect("valid regex")
});

static STEP_ORDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)dependenc(?:y|ies) (?:not|were not|was not) (?:met|satisfied)|depends on .*(?:not (?:been |yet )?(?:executed|run|completed)|has not (?:run|executed|completed))|executed before its dependenc",
    )
    .expect("valid regex")
});

static MISSING_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)missing required step|\bstep not found\b|\bstep\s+['"]?[\w-]+['"]?\s+(?:was\s+)?not found|no step (?:with id|named)|unknown step|referenced step .*does not exist"#,
    )
    .expect("valid regex")
});

static LOGIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)condition evaluation|evaluat(?:e|ing) (?:the )?condition|condition (?:failed|error|is invalid)|invalid condition|conditional expression",
    )
    .expect("valid regex")
});

/// Classify a step failure
#[must_use]
pub fn classify(error: &StepError, step: &StepContext<'_>) -> FailureClassification {
    let code = error
        .code
        .as_deref()
        .map(|c| c.trim().to_ascii_uppercase())
        .unwrap_or_default();
    let message = error.message.as_str();
    let status = http_status(&code, message);

    if status == Some(401) {
        return auth(FailureSubType::Auth);
    }

    shape_mismatch(&code, message, step)
        .or_else(|| data_unavailable(&code, message))
        .or_else(|| transient(&code, message, status))
        .or_else(|| auth_or_configuration(&code, message, status))
        .or_else(|| structural(&code, message))
        .unwrap_or_else(FailureClassification::unknown)
}

/// Message contains a quoted resource value
#[must_use]
pub fn has_quoted_value(message: &str) -> bool {
    QUOTED_VALUE.is_match(message)
}

/// Configuration value named in an "X 'value' not found" message
///
/// Returns the parameter the value belongs to, e.g. `spreadsheet_id` for
/// `Spreadsheet 'abc123' not found`.
#[must_use]
pub fn detect_parameter_error(message: &str) -> Option<ParameterError> {
    let caps = PARAMETER_NOT_FOUND.captures(message)?;
    let resource = caps.get(1)?.as_str().to_lowercase();
    let value = caps.get(2)?.as_str();
    let parameter_name = match resource.as_str() {
        "spreadsheet" => "spreadsheet_id",
        "range" => "range",
        "sheet" => "sheet_name",
        "column" => "column_name",
        "field" => "field_name",
        "file" => "file_id",
        "folder" => "folder_id",
        "document" => "document_id",
        "table" => "table_name",
        _ => return None,
    };
    Some(ParameterError {
        parameter_name: parameter_name.to_string(),
        problematic_value: value.to_string(),
        resource,
    })
}

fn http_status(code: &str, message: &str) -> Option<u16> {
    if let Ok(status) = code.parse::<u16>() {
        if (100..600).contains(&status) {
            return Some(status);
        }
    }
    STATUS_IN_MESSAGE
        .captures(message)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .and_then(|m| m.as_str().parse().ok())
}

fn auth(sub_type: FailureSubType) -> FailureClassification {
    FailureClassification::new(FailureCategory::ExecutionError, Severity::Critical)
        .with_sub_type(sub_type)
}

fn shape_mismatch(
    code: &str,
    message: &str,
    step: &StepContext<'_>,
) -> Option<FailureClassification> {
    let from_code = match code {
        "INVALID_TRANSFORM_INPUT" => Some(FailureSubType::TransformInput),
        "INVALID_SCATTER_INPUT" => Some(FailureSubType::ScatterInput),
        "INVALID_ITERATE_INPUT" | "INVALID_LOOP_INPUT" => Some(FailureSubType::IterateInput),
        "DATA_SHAPE_MISMATCH" | "INVALID_INPUT_TYPE" | "TYPE_MISMATCH" => {
            Some(shape_sub_type(message, step))
        }
        _ => None,
    };

    let sub_type = match from_code {
        Some(sub) => sub,
        None if SHAPE_MISMATCH.is_match(message) => shape_sub_type(message, step),
        None => return None,
    };

    Some(
        FailureClassification::new(FailureCategory::DataShapeMismatch, Severity::High)
            .with_sub_type(sub_type),
    )
}

fn shape_sub_type(message: &str, step: &StepContext<'_>) -> FailureSubType {
    let lower = message.to_ascii_lowercase();
    if lower.contains("transform") {
        return FailureSubType::TransformInput;
    }
    if lower.contains("scatter") {
        return FailureSubType::ScatterInput;
    }
    if lower.contains("iterat") || lower.contains("loop") {
        return FailureSubType::IterateInput;
    }
    match step.step_type.map(str::to_ascii_lowercase).as_deref() {
        Some("transform") => FailureSubType::TransformInput,
        Some("scatter" | "scatter_gather") => FailureSubType::ScatterInput,
        Some("loop" | "iterate" | "for_each") => FailureSubType::IterateInput,
        _ => FailureSubType::Generic,
    }
}

fn data_unavailable(code: &str, message: &str) -> Option<FailureClassification> {
    let sub_type = match code {
        "MISSING_REQUIRED_FIELD" => FailureSubType::MissingField,
        "MISSING_INPUT_DATA" | "NO_DATA" | "EMPTY_RESULT" | "EMPTY_RESULTS" | "DATA_NOT_FOUND" => {
            FailureSubType::EmptyResults
        }
        _ if MISSING_FIELD.is_match(message) => FailureSubType::MissingField,
        _ if EMPTY_RESULTS.is_match(message) => FailureSubType::EmptyResults,
        _ => return None,
    };

    Some(
        FailureClassification::new(FailureCategory::DataUnavailable, Severity::Medium)
            .with_sub_type(sub_type),
    )
}

fn transient(code: &str, message: &str, status: Option<u16>) -> Option<FailureClassification> {
    let sub_type = match (code, status) {
        (_, Some(429)) | ("RATE_LIMITED" | "RATE_LIMIT_EXCEEDED" | "TOO_MANY_REQUESTS", _) => {
            FailureSubType::RateLimit
        }
        (_, Some(503)) | ("SERVICE_UNAVAILABLE", _) => FailureSubType::ServiceUnavailable,
        (_, Some(504)) | ("ETIMEDOUT" | "ESOCKETTIMEDOUT" | "TIMEOUT" | "DEADLINE_EXCEEDED", _) => {
            FailureSubType::Timeout
        }
        ("ECONNRESET" | "ECONNREFUSED" | "ECONNABORTED" | "EPIPE" | "EAI_AGAIN" | "NETWORK_ERROR", _) => {
            FailureSubType::Network
        }
        _ if RATE_LIMIT.is_match(message) => FailureSubType::RateLimit,
        _ if TIMEOUT.is_match(message) => FailureSubType::Timeout,
        _ if NETWORK.is_match(message) => FailureSubType::Network,
        _ if UNAVAILABLE.is_match(message) => FailureSubType::ServiceUnavailable,
        _ => return None,
    };

    Some(
        FailureClassification::new(FailureCategory::ExecutionError, Severity::Low)
            .with_sub_type(sub_type)
            .retryable(),
    )
}

/// Auth versus configuration precedence:
/// reconnect or an OAuth/credential keyword is auth; otherwise a quoted
/// resource value is configuration; otherwise a bare 403 is an insufficient
/// scope; a remaining "resource not found" is configuration.
fn auth_or_configuration(
    code: &str,
    message: &str,
    status: Option<u16>,
) -> Option<FailureClassification> {
    let reconnect = RECONNECT.is_match(message);
    let oauth = OAUTH.is_match(message)
        || matches!(code, "UNAUTHORIZED" | "INVALID_GRANT" | "AUTH_ERROR" | "TOKEN_EXPIRED");
    let forbidden =
        status == Some(403) || code == "FORBIDDEN" || FORBIDDEN.is_match(message);
    let resource_missing = status == Some(404)
        || matches!(code, "NOT_FOUND" | "RESOURCE_NOT_FOUND")
        || RESOURCE_NOT_FOUND.is_match(message);

    if !(reconnect || oauth || forbidden || resource_missing) {
        return None;
    }

    if reconnect || oauth {
        return Some(auth(FailureSubType::Auth));
    }
    if has_quoted_value(message) {
        return Some(configuration());
    }
    if forbidden {
        return Some(auth(FailureSubType::InsufficientScope));
    }
    Some(configuration())
}

fn configuration() -> FailureClassification {
    FailureClassification::new(FailureCategory::ExecutionError, Severity::High)
        .with_sub_type(FailureSubType::Configuration)
}

fn structural(code: &str, message: &str) -> Option<FailureClassification> {
    let (category, severity) = if matches!(
        code,
        "UNSUPPORTED_ACTION" | "CAPABILITY_NOT_SUPPORTED" | "CAPABILITY_MISMATCH"
    ) || CAPABILITY.is_match(message)
    {
        (FailureCategory::CapabilityMismatch, Severity::High)
    } else if matches!(code, "DEPENDENCY_NOT_MET" | "INVALID_STEP_ORDER")
        || STEP_ORDER.is_match(message)
    {
        (FailureCategory::InvalidStepOrder, Severity::High)
    } else if matches!(code, "STEP_NOT_FOUND" | "MISSING_STEP") || MISSING_STEP.is_match(message) {
        (FailureCategory::MissingStep, Severity::High)
    } else if matches!(code, "CONDITION_EVALUATION_FAILED" | "LOGIC_ERROR")
        || LOGIC.is_match(message)
    {
        (FailureCategory::LogicError, Severity::Medium)
    } else {
        return None;
    };
    Some(FailureClassification::new(category, severity))
}
