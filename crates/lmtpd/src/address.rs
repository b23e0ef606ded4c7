//! Envelope address handling: the lax angle-bracket path syntax used
//! on MAIL/RCPT, xtext codec for DSN parameters, detail splitting on
//! the recipient delimiter, and the operator address translation
//! template.

/// Parse `<address> [rest]`. The local part may be a quoted string
/// with backslash escapes; everything else runs to the closing `>`
/// and may not contain spaces. Returns the address without brackets
/// and the remainder after a single separating space.
pub fn parse_path(input: &str) -> Option<(&str, &str)> {
    let bytes = input.as_bytes();
    if bytes.first() != Some(&b'<') {
        return None;
    }
    let mut pos = 1;
    if bytes.get(pos) == Some(&b'"') {
        pos += 1;
        loop {
            match bytes.get(pos)? {
                b'"' => {
                    pos += 1;
                    break;
                }
                b'\\' => pos += 2,
                _ => pos += 1,
            }
        }
    }
    let start = 1;
    while bytes.get(pos) != Some(&b'>') {
        match bytes.get(pos)? {
            b' ' => return None,
            _ => pos += 1,
        }
    }
    let address = &input[start..pos];
    pos += 1;

    let rest = &input[pos..];
    match rest.as_bytes().first() {
        None => Some((address, "")),
        Some(b' ') => Some((address, &rest[1..])),
        Some(_) => None,
    }
}

/// If the local part is a quoted string containing no `@`, strip the
/// quotes and unescape it. Anything unexpected leaves the address
/// untouched.
pub fn unquote_local_part(address: &str) -> String {
    let bytes = address.as_bytes();
    if bytes.first() != Some(&b'"') {
        return address.to_string();
    }

    let mut unquoted = String::new();
    let mut pos = 1;
    loop {
        match bytes.get(pos) {
            None => return address.to_string(),
            Some(b'"') => {
                pos += 1;
                break;
            }
            Some(&b) => {
                let b = if b == b'\\' {
                    pos += 1;
                    match bytes.get(pos) {
                        None => return address.to_string(),
                        Some(&esc) => esc,
                    }
                } else {
                    b
                };
                if b == b'@' {
                    return address.to_string();
                }
                unquoted.push(b as char);
                pos += 1;
            }
        }
    }
    let rest = &address[pos..];
    if !rest.is_empty() && !rest.starts_with('@') {
        return address.to_string();
    }
    unquoted.push_str(rest);
    unquoted
}

/// Split `user<delim>detail@domain` on the first delimiter character
/// occurring before the `@`. Returns the address with the detail
/// removed, the delimiter that matched, and the detail itself.
pub fn split_detail(address: &str, delimiters: &str) -> (String, Option<char>, String) {
    if delimiters.is_empty() {
        return (address.to_string(), None, String::new());
    }

    let domain_pos = address.find('@');
    let delim_pos = address
        .find(|c| delimiters.contains(c))
        .filter(|&p| domain_pos.map(|d| p < d).unwrap_or(true));

    match delim_pos {
        None => (address.to_string(), None, String::new()),
        Some(p) => {
            let delim = address[p..].chars().next();
            match domain_pos {
                None => (address[..p].to_string(), delim, address[p + 1..].to_string()),
                Some(d) => (
                    format!("{}{}", &address[..p], &address[d..]),
                    delim,
                    address[p + 1..d].to_string(),
                ),
            }
        }
    }
}

/// Re-insert a detail into a (possibly rewritten) username, keeping
/// it in front of the domain.
pub fn add_detail(username: &str, delim: char, detail: &str) -> String {
    match username.find('@') {
        None => format!("{username}{delim}{detail}"),
        Some(d) => format!("{}{delim}{detail}{}", &username[..d], &username[d..]),
    }
}

/// Decode xtext: `+HH` with two hex digits yields one byte, any
/// other `+` is literal.
pub fn xtext_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'+' && i + 2 < bytes.len() {
            match u8::from_str_radix(&value[i + 1..i + 3], 16) {
                Ok(b) => {
                    decoded.push(b);
                    i += 3;
                }
                Err(_) => {
                    decoded.push(b'+');
                    i += 1;
                }
            }
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Encode xtext: printable US-ASCII except `+` and `=` passes
/// through, everything else becomes `+HH`.
pub fn xtext_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        if (33..=126).contains(&b) && b != b'+' && b != b'=' {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("+{b:02X}"));
        }
    }
    encoded
}

/// Apply the operator translation template, e.g. `mail-%u@%d`.
/// `%u`/`%n` capture the username, `%d` the domain; literal runs
/// must match exactly, captures run to the first occurrence of the
/// next literal, and a trailing capture takes the rest. On any
/// mismatch the address is returned unchanged. A template without a
/// `%d` capture yields `<username>@` with an empty domain.
pub fn translate(address: &str, template: &str) -> String {
    if template.is_empty() {
        return address.to_string();
    }

    let mut username = String::new();
    let mut domain = String::new();

    let mut tpl = template;
    let mut addr = address;

    // leading literal
    let lit_len = tpl.find('%').unwrap_or(tpl.len());
    if !addr.starts_with(&tpl[..lit_len]) {
        return address.to_string();
    }
    addr = &addr[lit_len..];
    tpl = &tpl[lit_len..];

    while !tpl.is_empty() {
        let dest = match tpl.as_bytes().get(1) {
            Some(b'n') | Some(b'u') => &mut username,
            Some(b'd') => &mut domain,
            _ => return address.to_string(),
        };
        tpl = &tpl[2..];

        if tpl.is_empty() {
            dest.push_str(addr);
            break;
        }
        let lit_len = tpl.find('%').unwrap_or(tpl.len());
        let literal = &tpl[..lit_len];
        let Some(found) = addr.find(literal) else {
            return address.to_string();
        };
        dest.push_str(&addr[..found]);
        tpl = &tpl[lit_len..];
        addr = &addr[found + literal.len()..];
    }

    format!("{username}@{domain}")
}
