//! Logical message addressing: `[svType.]service.method`.

use thiserror::Error;

/// Failure parsing a route string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// The route did not split into two or three dot-separated parts.
    #[error("invalid route {0:?}: expected \"service.method\" or \"svType.service.method\"")]
    InvalidFormat(String),
}

/// A parsed logical address.
///
/// An empty `sv_type` means "the local server type"; callers resolve that
/// default explicitly via [`Route::resolved_sv_type`] rather than baking it
/// into parsing, since parsing has no notion of "local".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// Target server type, empty when unspecified.
    pub sv_type: String,
    /// Service name.
    pub service: String,
    /// Method name.
    pub method: String,
}

impl Route {
    /// Parses `[svType.]service.method`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidFormat`] when the input does not split
    /// into exactly two or three dot-separated, non-empty parts.
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let parts: Vec<&str> = raw.split('.').collect();
        match parts.as_slice() {
            [service, method] if !service.is_empty() && !method.is_empty() => Ok(Self {
                sv_type: String::new(),
                service: (*service).to_owned(),
                method: (*method).to_owned(),
            }),
            [sv_type, service, method]
                if !sv_type.is_empty() && !service.is_empty() && !method.is_empty() =>
            {
                Ok(Self {
                    sv_type: (*sv_type).to_owned(),
                    service: (*service).to_owned(),
                    method: (*method).to_owned(),
                })
            }
            _ => Err(RouteError::InvalidFormat(raw.to_owned())),
        }
    }

    /// Full form `svType.service.method`, or the short form when `sv_type`
    /// is empty.
    #[must_use]
    pub fn format(&self) -> String {
        if self.sv_type.is_empty() {
            self.short()
        } else {
            format!("{}.{}.{}", self.sv_type, self.service, self.method)
        }
    }

    /// Short form `service.method`, always omitting `sv_type`.
    #[must_use]
    pub fn short(&self) -> String { format!("{}.{}", self.service, self.method) }

    /// Returns `sv_type` if set, else `local_type`.
    #[must_use]
    pub fn resolved_sv_type<'a>(&'a self, local_type: &'a str) -> &'a str {
        if self.sv_type.is_empty() {
            local_type
        } else {
            &self.sv_type
        }
    }

    /// Whether this route targets the given local server type, after
    /// defaulting an empty `sv_type`.
    #[must_use]
    pub fn is_local(&self, local_type: &str) -> bool {
        self.resolved_sv_type(local_type) == local_type
    }
}
