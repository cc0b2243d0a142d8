//! Renders the `spec.args` mapping into the `programArgs` string handed to
//! the job manager. Literal values pass through; template records substitute
//! positional `{N}` token placeholders and optionally encode the result.

use crate::crd::ArgValue;
use indexmap::IndexMap;
use snafu::Snafu;

#[derive(Debug, Snafu, Clone, PartialEq)]
pub enum ArgsError {
    #[snafu(display("token placeholder {{{}}} is out of range ({} tokens)", index, count))]
    TokenOutOfRange { index: usize, count: usize },
    #[snafu(display("unsupported encoding '{}'", encoding))]
    UnsupportedEncoding { encoding: String },
    #[snafu(display("unclosed placeholder in template '{}'", format))]
    MalformedTemplate { format: String },
}

/// Build `--k1=v1 --k2=v2 ` in the order the args are declared.
pub fn build_args(
    args: &IndexMap<String, ArgValue>,
    tokens: &[String],
) -> Result<String, ArgsError> {
    let mut rendered = String::new();
    for (key, value) in args {
        let value = match value {
            ArgValue::Literal(literal) => literal.clone(),
            ArgValue::Template(template) => {
                let substituted = substitute(&template.format, tokens)?;
                encode(substituted, template.encode.as_deref())?
            }
        };
        rendered.push_str(&format!("--{}={} ", key, value));
    }
    Ok(rendered)
}

/// Replace `{N}` with the N-th token. Braces around anything that is not an
/// index are copied through untouched.
fn substitute(format: &str, tokens: &[String]) -> Result<String, ArgsError> {
    let mut rendered = String::with_capacity(format.len());
    let mut rest = format;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open..];
        let close = tail.find('}').ok_or_else(|| ArgsError::MalformedTemplate {
            format: format.to_string(),
        })?;
        let inner = &tail[1..close];
        match inner.parse::<usize>() {
            Ok(index) => {
                let token = tokens.get(index).ok_or(ArgsError::TokenOutOfRange {
                    index,
                    count: tokens.len(),
                })?;
                rendered.push_str(token);
                rest = &tail[close + 1..];
            }
            Err(_) => {
                // not a placeholder: emit the brace and keep scanning behind
                // it, so nested placeholders are still found
                rendered.push('{');
                rest = &tail[1..];
            }
        }
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn encode(value: String, encoding: Option<&str>) -> Result<String, ArgsError> {
    match encoding {
        None => Ok(value),
        Some("base64") => Ok(base64::encode(value)),
        Some(other) => Err(ArgsError::UnsupportedEncoding {
            encoding: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::ArgTemplate;
    use indexmap::indexmap;

    fn template(format: &str, encode: Option<&str>) -> ArgValue {
        ArgValue::Template(ArgTemplate {
            format: format.to_string(),
            encode: encode.map(str::to_string),
        })
    }

    #[test]
    fn literals_pass_through_in_order() {
        let args = indexmap! {
            "runner".to_string() => ArgValue::Literal("FlinkRunner".to_string()),
            "streaming".to_string() => ArgValue::Literal("true".to_string()),
        };
        assert_eq!(
            build_args(&args, &[]).unwrap(),
            "--runner=FlinkRunner --streaming=true "
        );
    }

    #[test]
    fn templates_substitute_positional_tokens() {
        let args = indexmap! {
            "token".to_string() => template("user:{0}@{1}", None),
        };
        let tokens = vec!["alice".to_string(), "kafka:9092".to_string()];
        assert_eq!(
            build_args(&args, &tokens).unwrap(),
            "--token=user:alice@kafka:9092 "
        );
    }

    #[test]
    fn base64_encoding_is_applied_after_substitution() {
        let args = indexmap! {
            "auth".to_string() => template("{0}", Some("base64")),
        };
        let tokens = vec!["secret".to_string()];
        assert_eq!(
            build_args(&args, &tokens).unwrap(),
            format!("--auth={} ", base64::encode("secret"))
        );
    }

    #[test]
    fn non_index_braces_are_copied_verbatim() {
        let args = indexmap! {
            "json".to_string() => template("{\"key\":{0}}", None),
        };
        let tokens = vec!["1".to_string()];
        assert_eq!(build_args(&args, &tokens).unwrap(), "--json={\"key\":1} ");
    }

    #[test]
    fn out_of_range_tokens_fail() {
        let args = indexmap! {
            "a".to_string() => template("{2}", None),
        };
        assert_eq!(
            build_args(&args, &["only".to_string()]),
            Err(ArgsError::TokenOutOfRange { index: 2, count: 1 })
        );
    }

    #[test]
    fn unknown_encodings_fail() {
        let args = indexmap! {
            "a".to_string() => template("{0}", Some("rot13")),
        };
        assert_eq!(
            build_args(&args, &["x".to_string()]),
            Err(ArgsError::UnsupportedEncoding {
                encoding: "rot13".to_string(),
            })
        );
    }

    #[test]
    fn unclosed_placeholders_fail() {
        let args = indexmap! {
            "a".to_string() => template("{0", None),
        };
        assert!(matches!(
            build_args(&args, &["x".to_string()]),
            Err(ArgsError::MalformedTemplate { .. })
        ));
    }
}
