//! `${variable}` interpolation for build rules.
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Interpolate a string against a context. Variables are written as
/// `${variable}`; literal `$` and `\` are escaped with a leading `\`.
pub fn interpolate(input: &str, context: &BTreeMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => result.push('\\'),
                Some('$') => result.push('$'),
                Some(other) => {
                    return Err(Error::Interpolation(format!(
                        "invalid escape sequence \"\\{other}\". \
                         Do you mean to escape \\ with \\\\?"
                    )));
                }
                None => {
                    return Err(Error::Interpolation(
                        "malformed escape sequence. Do you mean to escape \\ with \\\\?".into(),
                    ));
                }
            },
            '$' => {
                if chars.next() != Some('{') {
                    return Err(Error::Interpolation(
                        "malformed use of variable. Variables are used as ${variable}. \
                         Do you mean to escape $ with \\$?"
                            .into(),
                    ));
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(Error::Interpolation(
                                "malformed use of variable. Cannot find matching } \
                                 denoting the end of variable."
                                    .into(),
                            ));
                        }
                    }
                }
                if name.is_empty() {
                    return Err(Error::Interpolation(
                        "malformed use of variable. Variable name is empty.".into(),
                    ));
                }
                let value = context
                    .get(&name)
                    .ok_or_else(|| Error::Interpolation(format!("undefined variable {name}")))?;
                result.push_str(value);
            }
            _ => result.push(c),
        }
    }

    Ok(result)
}
