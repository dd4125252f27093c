//! Outbound AT commands and their canonical wire renderings.
//!
//! `Display` produces the command line *without* the terminating CRLF; the
//! UART writer appends it. `HttpData` is the one two-phase command: its line
//! only opens the modem's bulk-data mode, and the coordinator streams the
//! payload once `DOWNLOAD` arrives.

use std::fmt;

use super::{BearerProfile, CfunType, ErrorVerbosity, HttpMethod};

/// Discriminant used to pair solicited replies with the active command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    At,
    SetErrorVerbosity,
    Echo,
    Cfun,
    SetBearerParam,
    QueryBearerParams,
    OpenBearer,
    CloseBearer,
    AttachGprs,
    QueryGprs,
    DetachGprs,
    QueryPositionTime,
    HttpInit,
    HttpTerm,
    HttpSetBearer,
    HttpSetUrl,
    HttpSetUa,
    HttpContentType,
    HttpMakeRequest,
    HttpRead,
    HttpData,
}

/// Every command the driver issues.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    At,
    SetErrorVerbosity(ErrorVerbosity),
    Echo { on: bool },
    Cfun { mode: CfunType, reset: bool },
    SetBearerParam { profile: BearerProfile, tag: String, value: String },
    QueryBearerParams { profile: BearerProfile },
    OpenBearer { profile: BearerProfile },
    CloseBearer { profile: BearerProfile },
    AttachGprs,
    QueryGprs,
    DetachGprs,
    QueryPositionTime { profile: BearerProfile },
    HttpInit,
    HttpTerm,
    HttpSetBearer { profile: BearerProfile },
    HttpSetUrl { url: String },
    HttpSetUa { user_agent: String },
    HttpContentType { content_type: String },
    HttpMakeRequest { method: HttpMethod },
    HttpRead,
    HttpData { payload: Vec<u8> },
}

impl Command {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::At => CommandKind::At,
            Self::SetErrorVerbosity(_) => CommandKind::SetErrorVerbosity,
            Self::Echo { .. } => CommandKind::Echo,
            Self::Cfun { .. } => CommandKind::Cfun,
            Self::SetBearerParam { .. } => CommandKind::SetBearerParam,
            Self::QueryBearerParams { .. } => CommandKind::QueryBearerParams,
            Self::OpenBearer { .. } => CommandKind::OpenBearer,
            Self::CloseBearer { .. } => CommandKind::CloseBearer,
            Self::AttachGprs => CommandKind::AttachGprs,
            Self::QueryGprs => CommandKind::QueryGprs,
            Self::DetachGprs => CommandKind::DetachGprs,
            Self::QueryPositionTime { .. } => CommandKind::QueryPositionTime,
            Self::HttpInit => CommandKind::HttpInit,
            Self::HttpTerm => CommandKind::HttpTerm,
            Self::HttpSetBearer { .. } => CommandKind::HttpSetBearer,
            Self::HttpSetUrl { .. } => CommandKind::HttpSetUrl,
            Self::HttpSetUa { .. } => CommandKind::HttpSetUa,
            Self::HttpContentType { .. } => CommandKind::HttpContentType,
            Self::HttpMakeRequest { .. } => CommandKind::HttpMakeRequest,
            Self::HttpRead => CommandKind::HttpRead,
            Self::HttpData { .. } => CommandKind::HttpData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::At => "AT",
            Self::SetErrorVerbosity(_) => "CMEE",
            Self::Echo { .. } => "ATE",
            Self::Cfun { .. } => "CFUN",
            Self::SetBearerParam { .. } => "SAPBR(3)",
            Self::QueryBearerParams { .. } => "SAPBR(2)",
            Self::OpenBearer { .. } => "SAPBR(1)",
            Self::CloseBearer { .. } => "SAPBR(0)",
            Self::AttachGprs => "CGATT(1)",
            Self::QueryGprs => "CGATT(?)",
            Self::DetachGprs => "CGATT(0)",
            Self::QueryPositionTime { .. } => "CIPGSMLOC",
            Self::HttpInit => "HTTPINIT",
            Self::HttpTerm => "HTTPTERM",
            Self::HttpSetBearer { .. } => "HTTPPARA(CID)",
            Self::HttpSetUrl { .. } => "HTTPPARA(URL)",
            Self::HttpSetUa { .. } => "HTTPPARA(UA)",
            Self::HttpContentType { .. } => "HTTPPARA(CONTENT)",
            Self::HttpMakeRequest { .. } => "HTTPACTION",
            Self::HttpRead => "HTTPREAD",
            Self::HttpData { .. } => "HTTPDATA",
        }
    }
}

/// Serial timeout handed to `AT+HTTPDATA`, derived from the payload length
/// at the worst-case line rate and clamped to the modem's accepted range.
fn http_data_timeout_ms(payload_len: usize) -> usize {
    (payload_len * 10_000 / 9600).clamp(1000, 120_000)
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At => write!(f, "AT"),
            Self::SetErrorVerbosity(v) => write!(f, "AT+CMEE={}", v.code()),
            Self::Echo { on } => write!(f, "ATE{}", u8::from(*on)),
            Self::Cfun { mode, reset } => {
                write!(f, "AT+CFUN={}{}", mode.code(), if *reset { ",1" } else { "" })
            }
            Self::SetBearerParam { profile, tag, value } => {
                write!(f, "AT+SAPBR=3,{},\"{tag}\",\"{value}\"", profile.cid())
            }
            Self::QueryBearerParams { profile } => write!(f, "AT+SAPBR=2,{}", profile.cid()),
            Self::OpenBearer { profile } => write!(f, "AT+SAPBR=1,{}", profile.cid()),
            Self::CloseBearer { profile } => write!(f, "AT+SAPBR=0,{}", profile.cid()),
            Self::AttachGprs => write!(f, "AT+CGATT=1"),
            Self::QueryGprs => write!(f, "AT+CGATT?"),
            Self::DetachGprs => write!(f, "AT+CGATT=0"),
            Self::QueryPositionTime { profile } => {
                write!(f, "AT+CIPGSMLOC=1,{}", profile.cid())
            }
            Self::HttpInit => write!(f, "AT+HTTPINIT"),
            Self::HttpTerm => write!(f, "AT+HTTPTERM"),
            Self::HttpSetBearer { profile } => {
                write!(f, "AT+HTTPPARA=\"CID\",{}", profile.cid())
            }
            Self::HttpSetUrl { url } => write!(f, "AT+HTTPPARA=\"URL\",\"{url}\""),
            Self::HttpSetUa { user_agent } => write!(f, "AT+HTTPPARA=\"UA\",\"{user_agent}\""),
            Self::HttpContentType { content_type } => {
                write!(f, "AT+HTTPPARA=\"CONTENT\",\"{content_type}\"")
            }
            Self::HttpMakeRequest { method } => write!(f, "AT+HTTPACTION={}", method.code()),
            Self::HttpRead => write!(f, "AT+HTTPREAD"),
            Self::HttpData { payload } => write!(
                f,
                "AT+HTTPDATA={},{}",
                payload.len(),
                http_data_timeout_ms(payload.len())
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_renderings() {
        assert_eq!(Command::At.to_string(), "AT");
        assert_eq!(Command::Echo { on: false }.to_string(), "ATE0");
        assert_eq!(Command::Echo { on: true }.to_string(), "ATE1");
        assert_eq!(
            Command::SetErrorVerbosity(ErrorVerbosity::Verbose).to_string(),
            "AT+CMEE=2"
        );
        assert_eq!(Command::AttachGprs.to_string(), "AT+CGATT=1");
        assert_eq!(Command::QueryGprs.to_string(), "AT+CGATT?");
        assert_eq!(Command::DetachGprs.to_string(), "AT+CGATT=0");
    }

    #[test]
    fn test_cfun_reset_suffix() {
        assert_eq!(
            Command::Cfun { mode: CfunType::Full, reset: false }.to_string(),
            "AT+CFUN=1"
        );
        assert_eq!(
            Command::Cfun { mode: CfunType::Full, reset: true }.to_string(),
            "AT+CFUN=1,1"
        );
    }

    #[test]
    fn test_bearer_renderings() {
        assert_eq!(
            Command::SetBearerParam {
                profile: BearerProfile::Profile0,
                tag: "APN".into(),
                value: "internet".into(),
            }
            .to_string(),
            "AT+SAPBR=3,1,\"APN\",\"internet\""
        );
        assert_eq!(
            Command::QueryBearerParams { profile: BearerProfile::Profile0 }.to_string(),
            "AT+SAPBR=2,1"
        );
        assert_eq!(
            Command::OpenBearer { profile: BearerProfile::Profile0 }.to_string(),
            "AT+SAPBR=1,1"
        );
        assert_eq!(
            Command::CloseBearer { profile: BearerProfile::Profile2 }.to_string(),
            "AT+SAPBR=0,3"
        );
    }

    #[test]
    fn test_http_renderings() {
        assert_eq!(Command::HttpInit.to_string(), "AT+HTTPINIT");
        assert_eq!(Command::HttpTerm.to_string(), "AT+HTTPTERM");
        assert_eq!(
            Command::HttpSetBearer { profile: BearerProfile::Profile0 }.to_string(),
            "AT+HTTPPARA=\"CID\",1"
        );
        assert_eq!(
            Command::HttpSetUrl { url: "http://api.example.com/packet".into() }.to_string(),
            "AT+HTTPPARA=\"URL\",\"http://api.example.com/packet\""
        );
        assert_eq!(
            Command::HttpContentType { content_type: "text/plain".into() }.to_string(),
            "AT+HTTPPARA=\"CONTENT\",\"text/plain\""
        );
        assert_eq!(
            Command::HttpMakeRequest { method: HttpMethod::Post }.to_string(),
            "AT+HTTPACTION=1"
        );
        assert_eq!(Command::HttpRead.to_string(), "AT+HTTPREAD");
    }

    #[test]
    fn test_http_data_timeout_clamps() {
        // 5 bytes would compute to 5ms; the floor is 1000ms
        assert_eq!(
            Command::HttpData { payload: b"hello".to_vec() }.to_string(),
            "AT+HTTPDATA=5,1000"
        );
        // a large payload pegs the ceiling
        assert_eq!(http_data_timeout_ms(200_000), 120_000);
        // in between scales linearly
        assert_eq!(http_data_timeout_ms(9600), 10_000);
    }

    #[test]
    fn test_gsmloc_rendering() {
        assert_eq!(
            Command::QueryPositionTime { profile: BearerProfile::Profile0 }.to_string(),
            "AT+CIPGSMLOC=1,1"
        );
    }
}
