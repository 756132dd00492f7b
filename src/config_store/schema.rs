use crate::errors::{AppError, AppResult};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Validator {
    Free,
    Bool,
    Range(i64, i64),
    Options(&'static [&'static str]),
}

impl Validator {
    /// Coerces `value` into something this validator accepts, falling back to `default`.
    pub fn correct(&self, value: &Value, default: &Value) -> Value {
        match self {
            Self::Free => match value {
                Value::Array(_) | Value::Object(_) => default.clone(),
                other => other.clone(),
            },
            Self::Bool => match value {
                Value::Bool(flag) => Value::Bool(*flag),
                Value::String(text) if text.eq_ignore_ascii_case("true") => Value::Bool(true),
                Value::String(text) if text.eq_ignore_ascii_case("false") => Value::Bool(false),
                _ => default.clone(),
            },
            Self::Range(min, max) => {
                let number = match value {
                    Value::Number(number) => number
                        .as_i64()
                        .or_else(|| number.as_f64().map(|float| float as i64)),
                    Value::String(text) => text.trim().parse::<i64>().ok(),
                    _ => None,
                };
                match number {
                    Some(number) => json!(number.clamp(*min, *max)),
                    None => default.clone(),
                }
            }
            Self::Options(options) => match value {
                Value::String(text) if options.contains(&text.as_str()) => value.clone(),
                _ => default.clone(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub group: &'static str,
    pub key: &'static str,
    pub default: Value,
    pub validator: Validator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Script,
    Profile,
}

#[derive(Debug)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn field(&self, group: &str, key: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|field| field.group == group && field.key == key)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }
}

fn field(group: &'static str, key: &'static str, default: Value, validator: Validator) -> FieldSpec {
    FieldSpec {
        group,
        key,
        default,
        validator,
    }
}

pub const TRANSITION_METHODS: &[&str] = &["NoAction", "ExitGame", "ExitEmulator"];
pub const RESULT_SEND_TIMES: &[&str] = &["Always", "FailureOnly", "Never"];
pub const PROFILE_MODES: &[&str] = &["Simple", "Detailed"];

static SCRIPT_SCHEMA: Lazy<Schema> = Lazy::new(|| Schema {
    fields: vec![
        field("Info", "Name", json!(""), Validator::Free),
        field("Info", "Path", json!("."), Validator::Free),
        field("Worker", "Executable", json!("MAA.exe"), Validator::Free),
        field("Worker", "ConfigFile", json!("config/gui.json"), Validator::Free),
        field("Worker", "LogFile", json!("debug/gui.log"), Validator::Free),
        field("Worker", "LogTimeStart", json!(1), Validator::Range(0, 1024)),
        field("Worker", "LogTimeEnd", json!(20), Validator::Range(1, 1024)),
        field("Worker", "LogTimeFormat", json!("%Y-%m-%d %H:%M:%S"), Validator::Free),
        field("Run", "RunTimesLimit", json!(3), Validator::Range(1, 1024)),
        field("Run", "ProxyTimesLimit", json!(0), Validator::Range(0, 1024)),
        field("Run", "ADBSearchRange", json!(3), Validator::Range(0, 3)),
        field("Run", "PriorityTimeLimit", json!(40), Validator::Range(1, 1024)),
        field("Run", "RoutineTimeLimit", json!(10), Validator::Range(1, 1024)),
        field(
            "Run",
            "TaskTransitionMethod",
            json!("ExitEmulator"),
            Validator::Options(TRANSITION_METHODS),
        ),
        field("Run", "PriorityWeeklyLimit", json!(true), Validator::Bool),
        field("Run", "DiscoveryWindow", json!(0), Validator::Range(0, 600)),
        field(
            "Notify",
            "SendTaskResultTime",
            json!("Always"),
            Validator::Options(RESULT_SEND_TIMES),
        ),
        field("Notify", "IfSendStatistic", json!(false), Validator::Bool),
        field("Notify", "IfSendJackpot", json!(true), Validator::Bool),
    ],
});

static PROFILE_SCHEMA: Lazy<Schema> = Lazy::new(|| Schema {
    fields: vec![
        field("Info", "Name", json!("New profile"), Validator::Free),
        field("Info", "Id", json!(""), Validator::Free),
        field("Info", "Server", json!("Official"), Validator::Free),
        field("Info", "Status", json!(true), Validator::Bool),
        field("Info", "RemainedDay", json!(-1), Validator::Range(-1, 9999)),
        field("Info", "Mode", json!("Simple"), Validator::Options(PROFILE_MODES)),
        field("Info", "Priority", json!("Close"), Validator::Free),
        field("Info", "Routine", json!(true), Validator::Bool),
        field("Info", "Stage", json!("-"), Validator::Free),
        field("Info", "MedicineNumb", json!(0), Validator::Range(0, 1024)),
        field("Data", "LastProxyDate", json!("2000-01-01"), Validator::Free),
        field("Data", "ProxyTimes", json!(0), Validator::Range(0, 9999)),
        field("Data", "LastPriorityDate", json!("2000-01-01"), Validator::Free),
        field("Data", "IfPassCheck", json!(true), Validator::Bool),
        field("Task", "IfWakeUp", json!(true), Validator::Bool),
        field("Task", "IfRecruiting", json!(true), Validator::Bool),
        field("Task", "IfBase", json!(true), Validator::Bool),
        field("Task", "IfCombat", json!(true), Validator::Bool),
        field("Task", "IfMission", json!(true), Validator::Bool),
        field("Task", "IfMall", json!(true), Validator::Bool),
        field("Task", "IfAutoRoguelike", json!(false), Validator::Bool),
        field("Task", "IfReclamation", json!(false), Validator::Bool),
    ],
});

impl SchemaKind {
    pub fn schema(self) -> &'static Schema {
        match self {
            Self::Script => &SCRIPT_SCHEMA,
            Self::Profile => &PROFILE_SCHEMA,
        }
    }
}

/// A group/key document whose keys are fixed by its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    kind: SchemaKind,
    values: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ConfigDocument {
    pub fn new(kind: SchemaKind) -> Self {
        let mut values: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for spec in kind.schema().fields() {
            values
                .entry(spec.group.to_string())
                .or_default()
                .insert(spec.key.to_string(), spec.default.clone());
        }
        Self { kind, values }
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn get(&self, group: &str, key: &str) -> AppResult<&Value> {
        self.values
            .get(group)
            .and_then(|entries| entries.get(key))
            .ok_or_else(|| AppError::NotFound(format!("config key {}.{}", group, key)))
    }

    pub fn set(&mut self, group: &str, key: &str, value: Value) -> AppResult<()> {
        let spec = self
            .kind
            .schema()
            .field(group, key)
            .ok_or_else(|| AppError::NotFound(format!("config key {}.{}", group, key)))?;
        let corrected = spec.validator.correct(&value, &spec.default);
        self.values
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), corrected);
        Ok(())
    }

    pub fn get_str(&self, group: &str, key: &str) -> AppResult<String> {
        Ok(match self.get(group, key)? {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    pub fn get_bool(&self, group: &str, key: &str) -> AppResult<bool> {
        match self.get(group, key)? {
            Value::Bool(flag) => Ok(*flag),
            other => Err(AppError::ConfigInvalid(format!(
                "{}.{} is not a boolean: {}",
                group, key, other
            ))),
        }
    }

    pub fn get_i64(&self, group: &str, key: &str) -> AppResult<i64> {
        self.get(group, key)?.as_i64().ok_or_else(|| {
            AppError::ConfigInvalid(format!("{}.{} is not an integer", group, key))
        })
    }

    /// Replaces every field from `raw`; missing or invalid entries take schema defaults.
    pub fn load(&mut self, raw: &Value) {
        for spec in self.kind.schema().fields() {
            let value = raw
                .get(spec.group)
                .and_then(|group| group.get(spec.key))
                .map(|value| spec.validator.correct(value, &spec.default))
                .unwrap_or_else(|| spec.default.clone());
            self.values
                .entry(spec.group.to_string())
                .or_default()
                .insert(spec.key.to_string(), value);
        }
    }

    pub fn from_value(kind: SchemaKind, raw: &Value) -> Self {
        let mut document = Self::new(kind);
        document.load(raw);
        document
    }

    pub fn to_dict(&self) -> Value {
        let mut groups = serde_json::Map::new();
        for (group, entries) in &self.values {
            let mut keys = serde_json::Map::new();
            for (key, value) in entries {
                keys.insert(key.clone(), value.clone());
            }
            groups.insert(group.clone(), Value::Object(keys));
        }
        Value::Object(groups)
    }
}
