use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The base type of a source attribute declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String { max_length: Option<u32> },
    Number,
    Boolean,
    Json,
    Object,
    Array,
    Embedding(u32),
    Ip4,
    Ip6,
    Uuid,
    Date,
    DateTime,
    Secret,
}

/// A parsed attribute declaration, e.g. `string|maxlength:255|required`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDecl {
    pub name: String,
    pub ty: AttributeType,
    pub required: bool,
}

#[derive(Debug, Error)]
pub enum AttributeError {
    #[error("unknown attribute type: {0}")]
    UnknownType(String),

    #[error("invalid modifier `{modifier}` in declaration `{decl}`")]
    InvalidModifier { modifier: String, decl: String },

    #[error("empty attribute declaration")]
    Empty,
}

impl AttributeDecl {
    /// Parses a declaration string of the form `<type>[|modifier[:arg]]...`.
    pub fn parse(name: &str, decl: &str) -> Result<Self, AttributeError> {
        let mut parts = decl.split('|').map(str::trim).filter(|p| !p.is_empty());
        let base = parts.next().ok_or(AttributeError::Empty)?;

        let mut ty = parse_base_type(base, decl)?;
        let mut required = false;

        for part in parts {
            let (modifier, arg) = match part.split_once(':') {
                Some((m, a)) => (m, Some(a)),
                None => (part, None),
            };
            match (modifier, arg) {
                ("required", None) => required = true,
                ("optional", None) => required = false,
                ("maxlength", Some(n)) => {
                    let n = n.parse::<u32>().map_err(|_| AttributeError::InvalidModifier {
                        modifier: part.to_string(),
                        decl: decl.to_string(),
                    })?;
                    if let AttributeType::String { max_length } = &mut ty {
                        *max_length = Some(n);
                    }
                }
                // Modifiers that do not affect the destination column shape
                // (default values, uniqueness, indexing) pass through.
                _ => {}
            }
        }

        Ok(AttributeDecl {
            name: name.to_string(),
            ty,
            required,
        })
    }
}

fn parse_base_type(base: &str, decl: &str) -> Result<AttributeType, AttributeError> {
    if let Some(dims) = base.strip_prefix("embedding:") {
        let dims = dims.parse::<u32>().map_err(|_| AttributeError::InvalidModifier {
            modifier: base.to_string(),
            decl: decl.to_string(),
        })?;
        return Ok(AttributeType::Embedding(dims));
    }

    match base {
        "string" => Ok(AttributeType::String { max_length: None }),
        "number" => Ok(AttributeType::Number),
        "boolean" | "bool" => Ok(AttributeType::Boolean),
        "json" => Ok(AttributeType::Json),
        "object" => Ok(AttributeType::Object),
        "array" => Ok(AttributeType::Array),
        "ip4" => Ok(AttributeType::Ip4),
        "ip6" => Ok(AttributeType::Ip6),
        "uuid" => Ok(AttributeType::Uuid),
        "date" => Ok(AttributeType::Date),
        "datetime" => Ok(AttributeType::DateTime),
        "secret" => Ok(AttributeType::Secret),
        other => Err(AttributeError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_string() {
        let attr = AttributeDecl::parse("email", "string").unwrap();
        assert_eq!(attr.ty, AttributeType::String { max_length: None });
        assert!(!attr.required);
    }

    #[test]
    fn parses_maxlength_and_required() {
        let attr = AttributeDecl::parse("email", "string|maxlength:255|required").unwrap();
        assert_eq!(attr.ty, AttributeType::String { max_length: Some(255) });
        assert!(attr.required);
    }

    #[test]
    fn parses_embedding_dimensions() {
        let attr = AttributeDecl::parse("vec", "embedding:1536").unwrap();
        assert_eq!(attr.ty, AttributeType::Embedding(1536));
    }

    #[test]
    fn ignores_unknown_modifiers() {
        let attr = AttributeDecl::parse("n", "number|default:0").unwrap();
        assert_eq!(attr.ty, AttributeType::Number);
    }

    #[test]
    fn rejects_unknown_base_type() {
        let err = AttributeDecl::parse("x", "matrix").unwrap_err();
        assert!(matches!(err, AttributeError::UnknownType(t) if t == "matrix"));
    }

    #[test]
    fn rejects_bad_maxlength() {
        let err = AttributeDecl::parse("x", "string|maxlength:abc").unwrap_err();
        assert!(matches!(err, AttributeError::InvalidModifier { .. }));
    }
}
