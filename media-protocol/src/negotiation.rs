//! Media types, `Accept` lists and the rules for picking a representation.

use std::fmt;

use media_blob::ProviderCall;
use media_core::{MediaError, MediaResult};

/// The only structured format entries are served in.
pub const ENTRY_FORMAT: &str = "application/json";

/// A parsed `type/subtype;param=value` media type. Names are lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub main: String,
    pub sub: String,
    pub params: Vec<(String, String)>,
}

impl MediaType {
    pub fn parse(raw: &str) -> MediaResult<Self> {
        let mut parts = raw.split(';');
        let essence = parts.next().unwrap_or("").trim();
        let (main, sub) = essence
            .split_once('/')
            .filter(|(main, _)| !main.trim().is_empty())
            .ok_or_else(|| MediaError::bad_request("Media type is unspecified."))?;
        let sub = sub.trim();
        if sub.is_empty() {
            return Err(MediaError::bad_request("Media type requires a subtype definition."));
        }
        if sub.contains('/') {
            return Err(MediaError::bad_request(format!("Media type '{essence}' is not valid.")));
        }

        let mut params = Vec::new();
        for param in parts {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let (name, value) = param.split_once('=').ok_or_else(|| {
                MediaError::bad_request(format!("Media type parameter '{param}' is malformed."))
            })?;
            params.push((
                name.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            ));
        }

        Ok(Self {
            main: main.trim().to_ascii_lowercase(),
            sub: sub.to_ascii_lowercase(),
            params,
        })
    }

    pub fn entry() -> Self {
        Self {
            main: "application".into(),
            sub: "json".into(),
            params: Vec::new(),
        }
    }

    /// `type/subtype` without parameters.
    pub fn essence(&self) -> String {
        format!("{}/{}", self.main, self.sub)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is the structured entry format.
    pub fn is_entry_format(&self) -> bool {
        self.main == "application" && self.sub == "json"
    }

    /// Treat `self` as a range and test whether `concrete` falls inside it.
    /// Range parameters other than `q` must be present on `concrete`.
    pub fn matches(&self, concrete: &MediaType) -> bool {
        let type_ok = self.main == "*" || (self.main == concrete.main && (self.sub == "*" || self.sub == concrete.sub));
        type_ok
            && self
                .params
                .iter()
                .filter(|(name, _)| name != "q")
                .all(|(name, value)| {
                    concrete
                        .param(name)
                        .is_some_and(|v| v.eq_ignore_ascii_case(value))
                })
    }

    fn specificity(&self) -> u8 {
        match (self.main.as_str(), self.sub.as_str()) {
            ("*", _) => 0,
            (_, "*") => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.main, self.sub)?;
        for (name, value) in &self.params {
            write!(f, ";{name}={value}")?;
        }
        Ok(())
    }
}

/// One range of an `Accept` header with its weight in thousandths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptItem {
    pub range: MediaType,
    pub quality: u16,
}

/// A parsed `Accept` header, kept in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept {
    items: Vec<AcceptItem>,
}

impl Default for Accept {
    fn default() -> Self {
        Self::any()
    }
}

impl Accept {
    /// `*/*`
    pub fn any() -> Self {
        Self {
            items: vec![AcceptItem {
                range: MediaType {
                    main: "*".into(),
                    sub: "*".into(),
                    params: Vec::new(),
                },
                quality: 1000,
            }],
        }
    }

    /// A missing or blank header accepts everything.
    pub fn parse(header: Option<&str>) -> MediaResult<Self> {
        let Some(header) = header.filter(|h| !h.trim().is_empty()) else {
            return Ok(Self::any());
        };
        let mut items = Vec::new();
        for part in header.split(',') {
            if part.trim().is_empty() {
                continue;
            }
            let mut range = MediaType::parse(part)?;
            let quality = match range.param("q") {
                Some(q) => parse_quality(q)?,
                None => 1000,
            };
            range.params.retain(|(name, _)| name != "q");
            items.push(AcceptItem { range, quality });
        }
        Ok(Self { items })
    }

    pub fn items(&self) -> &[AcceptItem] {
        &self.items
    }

    /// Ranges as strings, highest preference first.
    pub fn preferred(&self) -> Vec<String> {
        let mut sorted: Vec<&AcceptItem> = self.items.iter().collect();
        sorted.sort_by(|a, b| b.quality.cmp(&a.quality));
        sorted.iter().map(|i| i.range.to_string()).collect()
    }

    /// Weight of `offered`, taken from the most specific matching range.
    pub fn quality_of(&self, offered: &MediaType) -> u16 {
        self.items
            .iter()
            .filter(|item| item.range.matches(offered))
            .fold(None::<&AcceptItem>, |best, item| match best {
                Some(b) if b.range.specificity() >= item.range.specificity() => Some(b),
                _ => Some(item),
            })
            .map(|item| item.quality)
            .unwrap_or(0)
    }

    /// The offered type if the client accepts it.
    pub fn negotiate(&self, offered: &MediaType) -> Option<MediaType> {
        (self.quality_of(offered) > 0).then(|| offered.clone())
    }
}

fn parse_quality(raw: &str) -> MediaResult<u16> {
    let invalid = || MediaError::bad_request(format!("The quality value '{raw}' in the Accept header is not valid."));
    let value: f32 = raw.trim().parse().map_err(|_| invalid())?;
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid());
    }
    Ok((value * 1000.0).round() as u16)
}

/// Content type a client declared for the bytes it is sending.
pub fn resolve_request_content_type(header: Option<&str>) -> MediaResult<MediaType> {
    match header.map(str::trim).filter(|h| !h.is_empty()) {
        Some(raw) => MediaType::parse(raw),
        None => Err(MediaError::bad_request("Content-Type header value missing.")),
    }
}

/// Content type a provider hook answered.
pub fn resolve_provider_content_type(call: ProviderCall, raw: Option<&str>) -> MediaResult<MediaType> {
    match raw.filter(|r| !r.is_empty()) {
        Some(raw) => MediaType::parse(raw),
        None => Err(MediaError::general_error(format!(
            "{} must not return a null or empty string.",
            call.method_path()
        ))),
    }
}

/// Entries are only available as JSON; anything the client accepts besides
/// that is irrelevant.
pub fn negotiate_entry(accept: &Accept) -> MediaResult<MediaType> {
    accept.negotiate(&MediaType::entry()).ok_or_else(|| {
        MediaError::unsupported_media_type(format!(
            "None of the media types in the Accept header can represent an entry; '{ENTRY_FORMAT}' is required."
        ))
    })
}
