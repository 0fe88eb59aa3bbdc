use indexmap::IndexMap;

use super::Value;

/// Parse INI text. Keys before the first section header live at the top
/// level; each `[section]` becomes a nested mapping.
pub fn parse(content: &str) -> Result<Value, String> {
    let mut root: IndexMap<String, Value> = IndexMap::new();
    let mut section: Option<String> = None;

    for (number, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }

        if let Some(header) = trimmed.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .ok_or_else(|| format!("line {}: unterminated section header", number + 1))?
                .trim();
            root.entry(name.to_string())
                .or_insert_with(|| Value::Mapping(IndexMap::new()));
            section = Some(name.to_string());
            continue;
        }

        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(format!("line {}: expected 'key = value'", number + 1));
        };
        let key = key.trim().to_string();
        let value = Value::String(unquote(value.trim()).to_string());

        let target = match &section {
            None => &mut root,
            Some(name) => match root.get_mut(name) {
                Some(Value::Mapping(map)) => map,
                _ => return Err(format!("line {}: section '{}' clashes with a key", number + 1, name)),
            },
        };
        target.insert(key, value);
    }

    Ok(Value::Mapping(root))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
