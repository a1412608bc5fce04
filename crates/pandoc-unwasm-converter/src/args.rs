//! Builds the argument string handed to the module's entry point.
//!
//! Order is fixed: `-f`, `-t`, shorthand flags, explicit options, filters,
//! metadata. Tokens are joined with single spaces and never quoted; the
//! module splits on whitespace.

use serde_json::Value;

use crate::options::ConversionOptions;
use pandoc_unwasm_common::RuntimeError;

fn nested(key: &str) -> RuntimeError {
    RuntimeError::conversion(
        format!("option '{key}' has an object value that cannot be passed as an argument"),
        None,
    )
}

/// Render `value` as a single argument token, or `None` for `null`.
fn scalar(key: &str, value: &Value) -> Result<Option<String>, RuntimeError> {
    match value {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Null => Ok(None),
        Value::Array(_) | Value::Object(_) => Err(nested(key)),
    }
}

/// Render an array as one comma-joined token. Inner arrays are flattened and
/// `null` elements render empty.
fn joined(key: &str, items: &[Value]) -> Result<String, RuntimeError> {
    let parts = items
        .iter()
        .map(|item| match item {
            Value::Array(inner) => joined(key, inner),
            other => Ok(scalar(key, other)?.unwrap_or_default()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(","))
}

fn push_option(args: &mut Vec<String>, key: &str, value: &Value) -> Result<(), RuntimeError> {
    let flag = format!("--{key}");
    match value {
        Value::Bool(true) => args.push(flag),
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                if matches!(item, Value::Array(_) | Value::Object(_)) {
                    return Err(RuntimeError::conversion(
                        format!("option '{key}' contains a nested array or object"),
                        None,
                    ));
                }
                push_option(args, key, item)?;
            }
        }
        other => {
            if let Some(token) = scalar(key, other)? {
                args.push(flag);
                args.push(token);
            }
        }
    }
    Ok(())
}

/// Build the argument tokens for `options`.
///
/// # Errors
///
/// Returns `RuntimeError::Conversion` if an option or metadata value is an
/// object, or an option array holds anything but scalars.
pub fn build_argv(options: &ConversionOptions) -> Result<Vec<String>, RuntimeError> {
    let mut args = Vec::new();

    if !options.from.is_empty() {
        args.extend(["-f".to_string(), options.from.clone()]);
    }
    if !options.to.is_empty() {
        args.extend(["-t".to_string(), options.to.clone()]);
    }

    // Shorthand fields yield to an explicit entry for the same option.
    let explicit = |key: &str| options.options.contains_key(key);
    if options.standalone == Some(true) && !explicit("standalone") {
        args.push("--standalone".to_string());
    }
    if options.toc == Some(true) && !explicit("toc") {
        args.push("--toc".to_string());
    }
    if let Some(template) = options.template.as_ref().filter(|_| !explicit("template")) {
        args.extend(["--template".to_string(), template.clone()]);
    }
    if !explicit("variable") {
        for (key, value) in &options.variables {
            let value = scalar(key, value)?.unwrap_or_default();
            args.extend(["--variable".to_string(), format!("{key}:{value}")]);
        }
    }

    for (key, value) in &options.options {
        push_option(&mut args, key, value)?;
    }

    for filter in &options.filters {
        args.extend(["--filter".to_string(), filter.clone()]);
    }

    for (key, value) in &options.metadata {
        let value = match value {
            Value::Null => "null".to_string(),
            Value::Array(items) => joined(key, items)?,
            other => scalar(key, other)?.unwrap_or_default(),
        };
        args.extend(["--metadata".to_string(), format!("{key}:{value}")]);
    }

    Ok(args)
}

/// Build the space-joined argument string for `options`.
///
/// # Errors
///
/// See [`build_argv`].
pub fn build_args(options: &ConversionOptions) -> Result<String, RuntimeError> {
    Ok(build_argv(options)?.join(" "))
}
