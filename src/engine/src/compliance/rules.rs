//! Rules and the built-in rule modules
//!
//! Built-ins are grouped into modules (`number`, `string`, `schema`) and are
//! addressed as `module.rule`. Each carries the metadata a UI needs to offer
//! it: label, description, argument descriptors and error text key.

use regex::Regex;
use serde_json::Value;
use std::fmt;

use super::sandbox::ScriptHandle;
use super::schema::{RuleArg, RuleDefinition};

/// Native rule body: `(value, args) -> holds?`; `Err` means it could not run
pub type BuiltinFn = fn(&Value, &[Value]) -> Result<bool, String>;

#[derive(Clone)]
pub enum Executable {
    Builtin(BuiltinFn),
    Script(ScriptHandle),
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(_) => write!(f, "Builtin"),
            Self::Script(handle) => write!(f, "Script({:?})", handle.source()),
        }
    }
}

/// A loaded rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub args: Vec<RuleArg>,
    pub error_text: Option<String>,
    pub executable: Executable,
}

impl Rule {
    pub fn builtin(module: &str, name: &str, args: Vec<RuleArg>, body: BuiltinFn) -> Self {
        Self {
            name: name.to_string(),
            label: Some(format!("common.rules.{module}.{name}.label")),
            description: Some(format!("common.rules.{module}.{name}.description")),
            args,
            error_text: Some(format!("common.rules.{module}.{name}.errorText")),
            executable: Executable::Builtin(body),
        }
    }

    pub fn scripted(definition: &RuleDefinition, handle: ScriptHandle) -> Self {
        Self {
            name: definition.name.clone(),
            label: definition.label.clone(),
            description: definition.description.clone(),
            args: definition.args.clone(),
            error_text: definition.error_text.clone(),
            executable: Executable::Script(handle),
        }
    }

    /// Text reported when a value breaks the rule
    pub fn failure_text(&self) -> String {
        self.error_text
            .clone()
            .unwrap_or_else(|| format!("Value does not comply with \"{}\"", self.name))
    }
}

/// A named group of built-in rules
#[derive(Debug, Clone)]
pub struct RulesModule {
    pub module: String,
    pub rules: Vec<Rule>,
}

/// Every built-in module
pub fn builtin_modules() -> Vec<RulesModule> {
    vec![number_module(), string_module(), schema_module()]
}

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn number_arg(value: Option<&Value>, rule: &str) -> Result<f64, String> {
    value
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("{rule} expects a numeric argument"))
}

fn inclusive_arg(value: Option<&Value>) -> bool {
    value.and_then(Value::as_bool).unwrap_or(true)
}

fn min(value: &Value, args: &[Value]) -> Result<bool, String> {
    let bound = number_arg(args.first(), "number.min")?;
    let inclusive = inclusive_arg(args.get(1));
    Ok(match value.as_f64().filter(|v| v.is_finite()) {
        Some(v) if inclusive => v >= bound,
        Some(v) => v > bound,
        None => false,
    })
}

fn max(value: &Value, args: &[Value]) -> Result<bool, String> {
    let bound = number_arg(args.first(), "number.max")?;
    let inclusive = inclusive_arg(args.get(1));
    Ok(match value.as_f64().filter(|v| v.is_finite()) {
        Some(v) if inclusive => v <= bound,
        Some(v) => v < bound,
        None => false,
    })
}

fn int(value: &Value, _args: &[Value]) -> Result<bool, String> {
    Ok(match value {
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => (i.unsigned_abs() as f64) <= MAX_SAFE_INTEGER,
            (_, Some(u), _) => (u as f64) <= MAX_SAFE_INTEGER,
            (_, _, Some(f)) => f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER,
            _ => false,
        },
        _ => false,
    })
}

fn precision(value: &Value, args: &[Value]) -> Result<bool, String> {
    let digits = args
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| "number.precision expects a digit count".to_string())?;
    let pattern = Regex::new(&format!(r"^[0-9]+\.([0-9]{{{digits}}})$"))
        .map_err(|e| e.to_string())?;
    Ok(match value {
        Value::Number(n) => pattern.is_match(&plain_number(n)),
        _ => false,
    })
}

/// Shortest decimal form, with integral floats printed without a fraction
fn plain_number(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => format!("{:.0}", f),
        _ => n.to_string(),
    }
}

pub fn number_module() -> RulesModule {
    let bound_args = || {
        vec![
            RuleArg::new("number", true),
            RuleArg::new("number", true),
            RuleArg::new("boolean", false),
        ]
    };

    RulesModule {
        module: "number".to_string(),
        rules: vec![
            Rule::builtin("number", "min", bound_args(), min),
            Rule::builtin("number", "max", bound_args(), max),
            Rule::builtin("number", "int", vec![RuleArg::new("number", true)], int),
            Rule::builtin(
                "number",
                "precision",
                vec![RuleArg::new("number", true), RuleArg::new("number", true)],
                precision,
            ),
        ],
    }
}

/// Length of a string in characters, or of an array in items
fn length(value: &Value, rule: &str) -> Result<usize, String> {
    match value {
        Value::String(s) => Ok(s.chars().count()),
        Value::Array(items) => Ok(items.len()),
        other => Err(format!("{rule} can not measure {other}")),
    }
}

fn string_match(value: &Value, args: &[Value]) -> Result<bool, String> {
    let pattern = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| "string.match expects a pattern".to_string())?;
    let text = value
        .as_str()
        .ok_or_else(|| format!("string.match can not match {value}"))?;
    let regex = Regex::new(pattern).map_err(|e| e.to_string())?;
    Ok(regex.is_match(text))
}

fn min_len(value: &Value, args: &[Value]) -> Result<bool, String> {
    let bound = number_arg(args.first(), "string.minLen")?;
    Ok(length(value, "string.minLen")? as f64 >= bound)
}

fn max_len(value: &Value, args: &[Value]) -> Result<bool, String> {
    let bound = number_arg(args.first(), "string.maxLen")?;
    Ok(length(value, "string.maxLen")? as f64 <= bound)
}

pub fn string_module() -> RulesModule {
    let args = |second: &str| vec![RuleArg::new("string", true), RuleArg::new(second, true)];

    RulesModule {
        module: "string".to_string(),
        rules: vec![
            Rule::builtin("string", "match", args("string"), string_match),
            Rule::builtin("string", "minLen", args("number"), min_len),
            Rule::builtin("string", "maxLen", args("number"), max_len),
        ],
    }
}

fn schema_valid(value: &Value, args: &[Value]) -> Result<bool, String> {
    let schema = args
        .first()
        .ok_or_else(|| "schema.valid expects a JSON schema".to_string())?;
    let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
    Ok(validator.is_valid(value))
}

pub fn schema_module() -> RulesModule {
    RulesModule {
        module: "schema".to_string(),
        rules: vec![Rule::builtin(
            "schema",
            "valid",
            vec![RuleArg::new("object", true), RuleArg::new("object", true)],
            schema_valid,
        )],
    }
}
