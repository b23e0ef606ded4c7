use crate::client_types::LmtpClientTimeouts;
use std::time::Duration;

/// Which flavor of the protocol a downstream destination speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Lmtp,
    Smtp,
}

impl Protocol {
    /// The conventional port when the routing entry doesn't name one.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Lmtp => 24,
            Self::Smtp => 25,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Lmtp => "lmtp",
            Self::Smtp => "smtp",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lmtp" => Ok(Self::Lmtp),
            "smtp" => Ok(Self::Smtp),
            wat => Err(format!("unknown protocol {wat}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl std::fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={}", self.name, value),
            None => write!(fmt, "{}", self.name),
        }
    }
}

/// Commands the outbound client can issue. Addresses are carried as
/// already-validated strings; by the time a recipient reaches the
/// client it has been through the server-side address parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Lhlo(String),
    Ehlo(String),
    MailFrom {
        address: String,
        parameters: Vec<EsmtpParameter>,
    },
    RcptTo {
        address: String,
        parameters: Vec<EsmtpParameter>,
    },
    Data,
    DataDot,
    Rset,
    Quit,
}

impl Command {
    pub fn encode(&self) -> String {
        fn render_params(parameters: &[EsmtpParameter]) -> String {
            let mut params = String::new();
            for p in parameters {
                params.push(' ');
                params.push_str(&p.to_string());
            }
            params
        }

        match self {
            Self::Lhlo(domain) => format!("LHLO {domain}\r\n"),
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::MailFrom {
                address,
                parameters,
            } => format!("MAIL FROM:<{address}>{}\r\n", render_params(parameters)),
            Self::RcptTo {
                address,
                parameters,
            } => format!("RCPT TO:<{address}>{}\r\n", render_params(parameters)),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
        }
    }

    /// The greeting command for the given protocol flavor.
    pub fn greeting(protocol: Protocol, my_hostname: &str) -> Self {
        match protocol {
            Protocol::Lmtp => Self::Lhlo(my_hostname.to_string()),
            Protocol::Smtp => Self::Ehlo(my_hostname.to_string()),
        }
    }

    /// Timeout for reading the response to this command.
    pub fn client_timeout(&self, timeouts: &LmtpClientTimeouts) -> Duration {
        match self {
            Self::Lhlo(_) | Self::Ehlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom { .. } => timeouts.mail_from_timeout,
            Self::RcptTo { .. } => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Rset | Self::Quit => timeouts.idle_timeout,
        }
    }

    /// Timeout for writing the request itself.
    pub fn client_timeout_request(&self, timeouts: &LmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}
