use indexmap::IndexMap;

/// Parse dotenv text into variables, in file order. A later assignment to
/// the same variable wins.
pub fn parse(content: &str) -> IndexMap<String, String> {
    let mut vars = IndexMap::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let assignment = trimmed
            .strip_prefix("export ")
            .or_else(|| trimmed.strip_prefix("export\t"))
            .unwrap_or(trimmed);

        let Some((name, raw)) = assignment.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        vars.insert(name.to_string(), parse_value(raw));
    }

    vars
}

fn parse_value(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Some(inner) = quoted(trimmed, '"') {
        return unescape(inner);
    }
    if let Some(inner) = quoted(trimmed, '\'') {
        return inner.to_string();
    }

    // sops writes multi-line values with escaped newlines
    let unquoted = match trimmed.find(" #") {
        Some(comment) => trimmed[..comment].trim_end(),
        None => trimmed,
    };
    unquoted.replace("\\n", "\n")
}

/// The text between an opening `quote` and its matching close, honouring
/// backslash escapes inside double quotes.
fn quoted(s: &str, quote: char) -> Option<&str> {
    let rest = s.strip_prefix(quote)?;
    let mut chars = rest.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\\' && quote == '"' {
            chars.next();
            continue;
        }
        if c == quote {
            return Some(&rest[..i]);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
