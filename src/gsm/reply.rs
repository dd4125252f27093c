//! Parsing of modem reply lines.
//!
//! One line in, one tagged [`Reply`] out. Each variant carries its
//! solicitation class: whether it can only appear spontaneously, always
//! belongs to the active command, or pairs with one specific command kind.
//! The coordinator uses that class to keep unsolicited noise out of callers'
//! reply vectors.

use super::{BearerProfile, BearerStatus, CfunType, CommandKind, HttpMethod, PinStatus};

/// Bearer context parameters from `+SAPBR`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BearerParams {
    pub profile: BearerProfile,
    pub status: BearerStatus,
    pub ipv4: bool,
    pub ip: [u8; 4],
}

/// GPRS attachment state from `+CGATT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprsStatus {
    pub attached: bool,
}

/// Network-derived position and wall time from `+CIPGSMLOC`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionTime {
    pub code: i32,
    pub unix_time: i32,
    pub longitude: f32,
    pub latitude: f32,
}

/// Completion notice for an HTTP action, `+HTTPACTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpActionDone {
    pub method: HttpMethod,
    pub code: i32,
    pub body_len: usize,
}

/// Body-length header preceding `+HTTPREAD` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpReadHeader {
    pub body_len: usize,
}

/// Session-reset challenge issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetChallenge {
    pub challenge: [u8; 32],
}

/// Session-reset rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetFailure {
    pub code: i32,
}

/// Session-reset acceptance carrying the PRNG initialization vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSuccess {
    pub prng_iv: [u32; 4],
}

/// Every reply the driver recognizes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Synthetic tick forged into the snooper broadcast; never parsed.
    PeriodicTick { ms: u32 },
    Ok,
    Error,
    Ready,
    CFun { mode: CfunType },
    CPin { status: PinStatus },
    BearerParams(BearerParams),
    CallReady,
    SmsReady,
    GprsStatus(GprsStatus),
    PositionTime(PositionTime),
    HttpActionDone(HttpActionDone),
    HttpReadHeader(HttpReadHeader),
    HttpReadyForData,
    ResetChallenge(ResetChallenge),
    ResetFailure(ResetFailure),
    ResetSuccess(ResetSuccess),
}

/// How a reply relates to the command currently on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Solicitation {
    /// Spontaneous; never paired with a command.
    Never,
    /// Pairs with whatever command is active.
    Always,
    /// Pairs only when a command of this kind is active.
    For(CommandKind),
}

impl Reply {
    #[must_use]
    pub fn solicitation(&self) -> Solicitation {
        match self {
            Self::PeriodicTick { .. }
            | Self::Ready
            | Self::CPin { .. }
            | Self::CallReady
            | Self::SmsReady
            | Self::HttpActionDone(_) => Solicitation::Never,
            Self::Ok | Self::Error => Solicitation::Always,
            Self::CFun { .. } => Solicitation::For(CommandKind::Cfun),
            Self::BearerParams(_) => Solicitation::For(CommandKind::QueryBearerParams),
            Self::GprsStatus(_) => Solicitation::For(CommandKind::QueryGprs),
            Self::PositionTime(_) => Solicitation::For(CommandKind::QueryPositionTime),
            Self::HttpReadyForData => Solicitation::For(CommandKind::HttpData),
            Self::HttpReadHeader(_)
            | Self::ResetChallenge(_)
            | Self::ResetFailure(_)
            | Self::ResetSuccess(_) => Solicitation::For(CommandKind::HttpRead),
        }
    }

    /// `OK` and `ERROR` close the active command's reply vector.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeriodicTick { .. } => "[periodic tick]",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Ready => "RDY",
            Self::CFun { .. } => "CFUN",
            Self::CPin { .. } => "CPIN",
            Self::BearerParams(_) => "SAPBR",
            Self::CallReady => "Call Ready",
            Self::SmsReady => "SMS Ready",
            Self::GprsStatus(_) => "CGATT",
            Self::PositionTime(_) => "CIPGSMLOC",
            Self::HttpActionDone(_) => "HTTPACTION",
            Self::HttpReadHeader(_) => "HTTPREAD",
            Self::HttpReadyForData => "DOWNLOAD",
            Self::ResetChallenge(_) => "CST_RESET_CHALLENGE",
            Self::ResetFailure(_) => "CST_RESET_FAIL",
            Self::ResetSuccess(_) => "CST_RESET_SUCC",
        }
    }
}

/// Parse one framed line into a [`Reply`].
///
/// Callers log parse failures and move on; an unknown line must never stall
/// the coordinator.
pub fn parse_reply(line: &str) -> Result<Reply, String> {
    let line = line.trim_start_matches(['\r', '\n']);

    if line.is_empty() {
        return Err("empty line".into());
    }

    if line.starts_with("OK") {
        return Ok(Reply::Ok);
    }
    if line.starts_with("ERRO") {
        return Ok(Reply::Error);
    }
    if line.starts_with("RDY") {
        return Ok(Reply::Ready);
    }
    if line.starts_with("+CFUN") {
        return parse_cfun(line);
    }
    if line.starts_with("+CPIN") {
        return parse_cpin(line);
    }
    if line.starts_with("Call R") {
        return Ok(Reply::CallReady);
    }
    if line.starts_with("SMS R") {
        return Ok(Reply::SmsReady);
    }
    if line.starts_with("DOWNLOAD") {
        return Ok(Reply::HttpReadyForData);
    }
    if let Some(rest) = line.strip_prefix("+CGATT: ") {
        return match rest.trim() {
            "0" => Ok(Reply::GprsStatus(GprsStatus { attached: false })),
            "1" => Ok(Reply::GprsStatus(GprsStatus { attached: true })),
            other => Err(format!("bad gprs status: {other}")),
        };
    }
    if let Some(rest) = line.strip_prefix("+SAPBR ") {
        return parse_bearer_deact(rest);
    }
    if let Some(rest) = line.strip_prefix("+SAPBR: ") {
        return parse_bearer_params(rest);
    }
    if let Some(rest) = line.strip_prefix("+CIPGSMLOC: ") {
        return parse_position_time(rest);
    }
    if let Some(rest) = line.strip_prefix("+HTTPACTION: ") {
        return parse_http_action(rest);
    }
    if let Some(rest) = line.strip_prefix("+HTTPREAD: ") {
        let body_len: usize = rest
            .trim()
            .parse()
            .map_err(|e| format!("bad http read length: {e}"))?;
        return Ok(Reply::HttpReadHeader(HttpReadHeader { body_len }));
    }
    if let Some(rest) = line.strip_prefix("+CST_RESET_CHALLENGE ") {
        let challenge = crate::hexspan::bytes32_from_hex(rest.trim())
            .map_err(|e| format!("bad challenge: {e}"))?;
        return Ok(Reply::ResetChallenge(ResetChallenge { challenge }));
    }
    if let Some(rest) = line.strip_prefix("+CST_RESET_FAIL ") {
        let code: i32 = rest
            .trim()
            .parse()
            .map_err(|e| format!("bad reset failure code: {e}"))?;
        return Ok(Reply::ResetFailure(ResetFailure { code }));
    }
    if let Some(rest) = line.strip_prefix("+CST_RESET_SUCC ") {
        let mut prng_iv = [0u32; 4];
        crate::hexspan::words_from_hex(rest.trim(), &mut prng_iv)
            .map_err(|e| format!("bad prng vector: {e}"))?;
        return Ok(Reply::ResetSuccess(ResetSuccess { prng_iv }));
    }

    Err("line did not match any known reply".into())
}

fn parse_cfun(line: &str) -> Result<Reply, String> {
    let code: u8 = line
        .split(':')
        .nth(1)
        .ok_or("malformed +CFUN line")?
        .trim()
        .parse()
        .map_err(|e| format!("bad cfun mode: {e}"))?;
    let mode = CfunType::from_code(code).ok_or(format!("unknown cfun mode {code}"))?;
    Ok(Reply::CFun { mode })
}

fn parse_cpin(line: &str) -> Result<Reply, String> {
    let status = match line.split(':').nth(1).ok_or("malformed +CPIN line")?.trim() {
        "READY" => PinStatus::Ready,
        "SIM PIN" | "SIM PIN2" | "PH_SIM PIN" => PinStatus::AwaitingPin,
        "SIM PUK" | "SIM PUK2" | "PH_SIM PUK" => PinStatus::AwaitingPuk,
        other => return Err(format!("unknown pin status: {other}")),
    };
    Ok(Reply::CPin { status })
}

/// `+SAPBR <cid>: DEACT` — a bearer the network tore down.
fn parse_bearer_deact(rest: &str) -> Result<Reply, String> {
    let (cid, tail) = rest.split_once(':').ok_or("malformed +SAPBR line")?;
    if tail.trim() != "DEACT" {
        return Err("malformed +SAPBR line".into());
    }
    let cid: u8 = cid.trim().parse().map_err(|e| format!("bad bearer cid: {e}"))?;
    let profile = BearerProfile::from_cid(cid).ok_or("bad bearer profile")?;
    Ok(Reply::BearerParams(BearerParams {
        profile,
        status: BearerStatus::Closed,
        ipv4: true,
        ip: [0, 0, 0, 0],
    }))
}

/// `+SAPBR: <cid>,<status>,"<ip>"` — answer to a bearer query.
fn parse_bearer_params(rest: &str) -> Result<Reply, String> {
    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return Err(format!("expected 3 fields in +SAPBR, got {}", parts.len()));
    }

    let cid: u8 = parts[0].parse().map_err(|e| format!("bad bearer cid: {e}"))?;
    let profile = BearerProfile::from_cid(cid).ok_or("bad bearer profile")?;

    let status = match parts[1] {
        "0" => BearerStatus::Connecting,
        "1" => BearerStatus::Connected,
        "2" => BearerStatus::Closing,
        "3" => BearerStatus::Closed,
        other => return Err(format!("bad bearer status: {other}")),
    };

    let ip = parse_ipv4(parts[2].trim_matches('"'))?;

    Ok(Reply::BearerParams(BearerParams {
        profile,
        status,
        ipv4: true,
        ip,
    }))
}

fn parse_ipv4(text: &str) -> Result<[u8; 4], String> {
    let mut octets = [0u8; 4];
    let mut parts = text.split('.');
    for slot in &mut octets {
        *slot = parts
            .next()
            .ok_or("bad bearer ip")?
            .parse()
            .map_err(|e| format!("bad bearer ip: {e}"))?;
    }
    if parts.next().is_some() {
        return Err("bad bearer ip".into());
    }
    Ok(octets)
}

/// `+CIPGSMLOC: <code>,<lon>,<lat>,<Y/M/D>,<H:M:S>`
fn parse_position_time(rest: &str) -> Result<Reply, String> {
    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    if parts.len() < 5 {
        return Err(format!("expected 5 fields in +CIPGSMLOC, got {}", parts.len()));
    }

    let code: i32 = parts[0].parse().map_err(|e| format!("bad gsmloc code: {e}"))?;
    let longitude: f32 = parts[1].parse().map_err(|e| format!("bad longitude: {e}"))?;
    let latitude: f32 = parts[2].parse().map_err(|e| format!("bad latitude: {e}"))?;

    let mut date = parts[3].split('/');
    let year: i32 = next_field(&mut date, "year")?;
    let month: u32 = next_field(&mut date, "month")?;
    let day: u32 = next_field(&mut date, "day")?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err("date out of range".into());
    }

    let mut time = parts[4].split(':');
    let hour: i64 = next_field(&mut time, "hour")?;
    let minute: i64 = next_field(&mut time, "minute")?;
    let second: i64 = next_field(&mut time, "second")?;
    if hour >= 24 || minute >= 60 || second >= 60 {
        return Err("time out of range".into());
    }

    let unix = days_from_civil(year, month, day) * 86_400 + hour * 3600 + minute * 60 + second;
    #[allow(clippy::cast_possible_truncation)]
    let unix_time = unix as i32;

    Ok(Reply::PositionTime(PositionTime {
        code,
        unix_time,
        longitude,
        latitude,
    }))
}

fn next_field<'a, T: std::str::FromStr>(
    parts: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    parts
        .next()
        .ok_or(format!("missing {what}"))?
        .parse()
        .map_err(|e| format!("bad {what}: {e}"))
}

/// Days since the Unix epoch for a proleptic-Gregorian civil date
/// (Hinnant's `days_from_civil`).
fn days_from_civil(y: i32, m: u32, d: u32) -> i64 {
    let y = y - i32::from(m <= 2);
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = i64::from(y - era * 400);
    let doy = i64::from((153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1);
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    i64::from(era) * 146_097 + doe - 719_468
}

/// `+HTTPACTION: <method>,<code>,<len>`
fn parse_http_action(rest: &str) -> Result<Reply, String> {
    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!("expected 3 fields in +HTTPACTION, got {}", parts.len()));
    }

    let method = match parts[0] {
        "0" => HttpMethod::Get,
        "1" => HttpMethod::Post,
        "2" => HttpMethod::Head,
        other => return Err(format!("bad http method: {other}")),
    };
    let code: i32 = parts[1].parse().map_err(|e| format!("bad http code: {e}"))?;
    let body_len: usize = parts[2].parse().map_err(|e| format!("bad body length: {e}"))?;

    Ok(Reply::HttpActionDone(HttpActionDone {
        method,
        code,
        body_len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_replies() {
        assert_eq!(parse_reply("OK").unwrap(), Reply::Ok);
        assert_eq!(parse_reply("ERROR").unwrap(), Reply::Error);
        assert_eq!(parse_reply("RDY").unwrap(), Reply::Ready);
        assert_eq!(parse_reply("Call Ready").unwrap(), Reply::CallReady);
        assert_eq!(parse_reply("SMS Ready").unwrap(), Reply::SmsReady);
        assert_eq!(parse_reply("DOWNLOAD").unwrap(), Reply::HttpReadyForData);
    }

    #[test]
    fn test_leading_crlf_stripped() {
        assert_eq!(parse_reply("\r\nOK").unwrap(), Reply::Ok);
    }

    #[test]
    fn test_empty_line_is_error() {
        assert!(parse_reply("").is_err());
        assert!(parse_reply("\r\n").is_err());
    }

    #[test]
    fn test_cfun() {
        assert_eq!(
            parse_reply("+CFUN: 1").unwrap(),
            Reply::CFun { mode: CfunType::Full }
        );
        assert!(parse_reply("+CFUN: 9").is_err());
    }

    #[test]
    fn test_cpin() {
        assert_eq!(
            parse_reply("+CPIN: READY").unwrap(),
            Reply::CPin { status: PinStatus::Ready }
        );
        assert_eq!(
            parse_reply("+CPIN: SIM PIN").unwrap(),
            Reply::CPin { status: PinStatus::AwaitingPin }
        );
    }

    #[test]
    fn test_cgatt() {
        assert_eq!(
            parse_reply("+CGATT: 1").unwrap(),
            Reply::GprsStatus(GprsStatus { attached: true })
        );
        assert_eq!(
            parse_reply("+CGATT: 0").unwrap(),
            Reply::GprsStatus(GprsStatus { attached: false })
        );
        assert!(parse_reply("+CGATT: 7").is_err());
    }

    #[test]
    fn test_bearer_deact() {
        let reply = parse_reply("+SAPBR 1: DEACT").unwrap();
        assert_eq!(
            reply,
            Reply::BearerParams(BearerParams {
                profile: BearerProfile::Profile0,
                status: BearerStatus::Closed,
                ipv4: true,
                ip: [0, 0, 0, 0],
            })
        );
    }

    #[test]
    fn test_bearer_query() {
        let reply = parse_reply("+SAPBR: 1,1,\"10.92.13.100\"").unwrap();
        assert_eq!(
            reply,
            Reply::BearerParams(BearerParams {
                profile: BearerProfile::Profile0,
                status: BearerStatus::Connected,
                ipv4: true,
                ip: [10, 92, 13, 100],
            })
        );
    }

    #[test]
    fn test_bearer_bad_profile() {
        assert!(parse_reply("+SAPBR: 9,1,\"0.0.0.0\"").is_err());
    }

    #[test]
    fn test_position_time_epoch() {
        // 2023-05-20 12:34:56 UTC = 1684586096
        let reply = parse_reply("+CIPGSMLOC: 0,29.028720,41.105690,2023/5/20,12:34:56").unwrap();
        let Reply::PositionTime(pos) = reply else {
            panic!("wrong variant");
        };
        assert_eq!(pos.code, 0);
        assert_eq!(pos.unix_time, 1_684_586_096);
        assert!((pos.longitude - 29.028_72).abs() < 1e-4);
        assert!((pos.latitude - 41.105_69).abs() < 1e-4);
    }

    #[test]
    fn test_position_time_short_form_rejected() {
        // location failures come back as just a status code
        assert!(parse_reply("+CIPGSMLOC: 601").is_err());
    }

    #[test]
    fn test_http_action() {
        let reply = parse_reply("+HTTPACTION: 1,200,38").unwrap();
        assert_eq!(
            reply,
            Reply::HttpActionDone(HttpActionDone {
                method: HttpMethod::Post,
                code: 200,
                body_len: 38,
            })
        );
    }

    #[test]
    fn test_http_read_header() {
        assert_eq!(
            parse_reply("+HTTPREAD: 129").unwrap(),
            Reply::HttpReadHeader(HttpReadHeader { body_len: 129 })
        );
    }

    #[test]
    fn test_reset_challenge() {
        let line = format!("+CST_RESET_CHALLENGE {}", "0".repeat(64));
        let Reply::ResetChallenge(c) = parse_reply(&line).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(c.challenge, [0u8; 32]);
    }

    #[test]
    fn test_reset_challenge_bad_length() {
        assert!(parse_reply("+CST_RESET_CHALLENGE abcd").is_err());
    }

    #[test]
    fn test_reset_success() {
        let reply = parse_reply("+CST_RESET_SUCC DEADBEEFCAFEBABEDEADC0DE8BADF00D").unwrap();
        assert_eq!(
            reply,
            Reply::ResetSuccess(ResetSuccess {
                prng_iv: [0xDEAD_BEEF, 0xCAFE_BABE, 0xDEAD_C0DE, 0x8BAD_F00D],
            })
        );
    }

    #[test]
    fn test_reset_failure() {
        assert_eq!(
            parse_reply("+CST_RESET_FAIL 3").unwrap(),
            Reply::ResetFailure(ResetFailure { code: 3 })
        );
    }

    #[test]
    fn test_unmatched_line() {
        assert!(parse_reply("+CREG: 0,1").is_err());
    }

    #[test]
    fn test_solicitation_classes() {
        assert_eq!(parse_reply("RDY").unwrap().solicitation(), Solicitation::Never);
        assert_eq!(parse_reply("OK").unwrap().solicitation(), Solicitation::Always);
        assert_eq!(
            parse_reply("+CGATT: 1").unwrap().solicitation(),
            Solicitation::For(CommandKind::QueryGprs)
        );
        assert_eq!(
            parse_reply("+HTTPACTION: 0,200,0").unwrap().solicitation(),
            Solicitation::Never
        );
    }
}
