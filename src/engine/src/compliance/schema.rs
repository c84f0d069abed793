//! Resource schema definitions
//!
//! A schema is a tree of named entries. Any entry, the root included, may
//! carry a `comply` block listing the rules its values must satisfy and
//! defining rules of its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One entry of a resource schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Declared JSON type of the entry's value
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Initial value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comply: Option<Comply>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            revision: None,
            kind: None,
            init: None,
            comply: None,
            children: Vec::new(),
        }
    }

    pub fn with_comply(mut self, comply: Comply) -> Self {
        self.comply = Some(comply);
        self
    }

    pub fn with_child(mut self, child: SchemaNode) -> Self {
        self.children.push(child);
        self
    }
}

/// Rules an entry must satisfy, plus rules it defines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comply {
    #[serde(default)]
    pub rules: Vec<RuleRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub define: Vec<RuleDefinition>,
}

/// Argument descriptor of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleArg {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RuleArg {
    pub fn new(kind: &str, required: bool) -> Self {
        Self {
            kind: kind.to_string(),
            required,
            label: None,
        }
    }
}

/// User-defined rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub args: Vec<RuleArg>,

    /// Rule body; sees `value` and `args`, must yield a boolean
    #[serde(rename = "fn")]
    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

/// Reference to a rule from a `comply.rules` list
///
/// Serialized as a bare name (`"entRule"`, `"number.int"`) or as an array
/// of name and arguments (`["number.min", 5, false]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct RuleRef {
    pub name: String,
    pub args: Vec<Value>,
}

impl RuleRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Dotted names address a rule directly instead of searching scopes
    pub fn is_qualified(&self) -> bool {
        self.name.contains('.')
    }
}

impl TryFrom<Value> for RuleRef {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(name) if !name.is_empty() => Ok(Self::new(name)),
            Value::Array(mut items) => {
                if items.is_empty() {
                    return Err("rule reference array must not be empty".to_string());
                }
                match items.remove(0) {
                    Value::String(name) if !name.is_empty() => Ok(Self::with_args(name, items)),
                    other => Err(format!("rule name must be a string, got {}", other)),
                }
            }
            other => Err(format!("invalid rule reference {}", other)),
        }
    }
}

impl From<RuleRef> for Value {
    fn from(rule: RuleRef) -> Self {
        if rule.args.is_empty() {
            Value::String(rule.name)
        } else {
            let mut items = Vec::with_capacity(rule.args.len() + 1);
            items.push(Value::String(rule.name));
            items.extend(rule.args);
            Value::Array(items)
        }
    }
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(Value::to_string).collect();
            write!(f, "({})", args.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_ref_forms() {
        let refs: Vec<RuleRef> =
            serde_json::from_value(json!(["entRule", ["number.min", 5, false]])).unwrap();

        assert_eq!(refs[0], RuleRef::new("entRule"));
        assert!(!refs[0].is_qualified());
        assert_eq!(refs[1], RuleRef::with_args("number.min", vec![json!(5), json!(false)]));
        assert!(refs[1].is_qualified());
        assert_eq!(refs[1].to_string(), "number.min(5, false)");

        assert_eq!(
            serde_json::to_value(&refs).unwrap(),
            json!(["entRule", ["number.min", 5, false]])
        );
    }

    #[test]
    fn test_rule_ref_rejects_garbage() {
        assert!(serde_json::from_value::<RuleRef>(json!([])).is_err());
        assert!(serde_json::from_value::<RuleRef>(json!(5)).is_err());
        assert!(serde_json::from_value::<RuleRef>(json!([1, 2])).is_err());
    }

    #[test]
    fn test_schema_with_extra_fields() {
        let schema: SchemaNode = serde_json::from_value(json!({
            "name": "entResource",
            "label": "Sample resource schema",
            "revision": "0.0.1",
            "children": [{
                "name": "ent",
                "type": "number",
                "init": 0,
                "comply": {
                    "rules": ["entRule"],
                    "define": [{
                        "name": "entRule",
                        "fn": "value >= 0",
                        "args": [{"type": "number", "required": true}],
                        "errorText": "Ent must be greater than 0"
                    }]
                }
            }]
        }))
        .unwrap();

        let ent = &schema.children[0];
        assert_eq!(ent.kind.as_deref(), Some("number"));
        let define = &ent.comply.as_ref().unwrap().define[0];
        assert_eq!(define.body, "value >= 0");
        assert_eq!(define.error_text.as_deref(), Some("Ent must be greater than 0"));
    }
}
