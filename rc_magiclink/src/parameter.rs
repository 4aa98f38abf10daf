use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// A packet parameter value.
///
/// Each variant has a single character wire tag: `n` number, `b` boolean,
/// `s` string, `a` array, `j` object.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    Number(Number),
    Boolean(bool),
    String(String),
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

#[derive(Serialize, Deserialize)]
struct WireParameter {
    t: char,
    v: Value,
}

impl Parameter {
    pub fn tag(&self) -> char {
        match self {
            Self::Number(_) => 'n',
            Self::Boolean(_) => 'b',
            Self::String(_) => 's',
            Self::Array(_) => 'a',
            Self::Object(_) => 'j',
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as i64)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(number) => number.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    fn to_wire(&self) -> WireParameter {
        let v = match self {
            Self::Number(number) => Value::Number(number.clone()),
            Self::Boolean(value) => Value::Bool(*value),
            Self::String(value) => Value::String(value.clone()),
            Self::Array(values) => Value::Array(values.clone()),
            Self::Object(map) => Value::Object(map.clone()),
        };
        WireParameter { t: self.tag(), v }
    }

    fn from_wire(wire: WireParameter) -> Result<Self, String> {
        match (wire.t, wire.v) {
            ('n', Value::Number(number)) => Ok(Self::Number(number)),
            ('b', Value::Bool(value)) => Ok(Self::Boolean(value)),
            ('s', Value::String(value)) => Ok(Self::String(value)),
            ('a', Value::Array(values)) => Ok(Self::Array(values)),
            ('j', Value::Object(map)) => Ok(Self::Object(map)),
            (tag @ ('n' | 'b' | 's' | 'a' | 'j'), value) => Err(format!(
                "value {} does not match parameter tag `{}`",
                value, tag
            )),
            (tag, _) => Err(format!("unknown parameter tag `{}`", tag)),
        }
    }
}

impl Serialize for Parameter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Parameter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireParameter::deserialize(deserializer)?;
        Parameter::from_wire(wire).map_err(de::Error::custom)
    }
}

macro_rules! number_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Parameter {
                fn from(value: $ty) -> Self {
                    Self::Number(Number::from(value))
                }
            }
        )*
    };
}

number_from!(i32, i64, u32, u64, usize);

impl From<f64> for Parameter {
    /// Non finite floats have no JSON representation and become `0`.
    fn from(value: f64) -> Self {
        Self::Number(Number::from_f64(value).unwrap_or_else(|| Number::from(0)))
    }
}

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<String> for Parameter {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Parameter {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<Vec<Value>> for Parameter {
    fn from(value: Vec<Value>) -> Self {
        Self::Array(value)
    }
}

impl From<Map<String, Value>> for Parameter {
    fn from(value: Map<String, Value>) -> Self {
        Self::Object(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_tags() {
        assert_eq!(
            serde_json::to_value(Parameter::from(5)).unwrap(),
            json!({"t": "n", "v": 5})
        );
        assert_eq!(
            serde_json::to_value(Parameter::from("lobby")).unwrap(),
            json!({"t": "s", "v": "lobby"})
        );
    }

    #[test]
    fn mismatched_tag_rejected() {
        assert!(serde_json::from_value::<Parameter>(json!({"t": "n", "v": "5"})).is_err());
        assert!(serde_json::from_value::<Parameter>(json!({"t": "x", "v": 5})).is_err());
    }

    #[test]
    fn accessors() {
        assert_eq!(Parameter::from(12u64).as_i64(), Some(12));
        assert_eq!(Parameter::from(1.5).as_f64(), Some(1.5));
        assert_eq!(Parameter::from(true).as_bool(), Some(true));
        assert_eq!(Parameter::from("x").as_i64(), None);
        assert_eq!(Parameter::from(vec![json!(1)]).as_array().map(|a| a.len()), Some(1));
    }
}
