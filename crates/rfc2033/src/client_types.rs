use std::time::Duration;

/// Per-command timeouts for the outbound client. The caller usually
/// derives these from the routing entry's proxy timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmtpClientTimeouts {
    pub connect_timeout: Duration,
    pub ehlo_timeout: Duration,
    pub mail_from_timeout: Duration,
    pub rcpt_to_timeout: Duration,
    pub data_timeout: Duration,
    pub data_dot_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for LmtpClientTimeouts {
    fn default() -> Self {
        Self::from_total(Duration::from_millis(125_000))
    }
}

impl LmtpClientTimeouts {
    /// Derive the per-command timeouts from a single overall budget,
    /// which is how proxy destinations express their timeout.
    pub fn from_total(total: Duration) -> Self {
        Self {
            connect_timeout: total,
            ehlo_timeout: total,
            mail_from_timeout: total,
            rcpt_to_timeout: total,
            data_timeout: total,
            data_dot_timeout: total,
            idle_timeout: Duration::from_secs(5).min(total),
        }
    }
}

/// A complete (possibly multiline) reply from the peer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Render the reply as a single line suitable for forwarding to
    /// the originating peer verbatim.
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);
        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }
        line.push_str(&flatten_line_breaks(&self.content));
        line
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // no other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

fn flatten_line_breaks(content: &str) -> String {
    content
        .lines()
        .collect::<Vec<&str>>()
        .join(" ")
        .trim_end()
        .to_string()
}

/// One parsed reply line: three digits followed by ' ' (final) or
/// '-' (continuation).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

pub(crate) fn parse_response_line(line: &str) -> Result<ResponseLine, String> {
    if line.len() < 4 {
        return Err(line.to_string());
    }
    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(line.to_string()),
        },
        _ => Err(line.to_string()),
    }
}

pub(crate) struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };
        Self {
            code: parsed.code,
            enhanced_code,
            content,
        }
    }

    /// Continuation lines must repeat the reply code of the first
    /// line; a mismatch invalidates the whole reply.
    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }

        self.content.push('\n');

        let mut content = parsed.content;
        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{}.{}.{} ", enh.class, enh.subject, enh.detail);
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }
        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self) -> Response {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.content,
        }
    }
}
