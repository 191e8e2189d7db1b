//! The wire status enum (spec §6.2) and the error taxonomy that maps onto it.

use std::fmt;

/// Outcome of a dispatched request, serialized as the response's `status:` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    NotModified,
    NotFound,
    Archived,
    Unauthorized,
    NotPermitted,
    Conflict,
    ServerError,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Created => "created",
            Status::NotModified => "not-modified",
            Status::NotFound => "not-found",
            Status::Archived => "archived",
            Status::Unauthorized => "unauthorized",
            Status::NotPermitted => "not-permitted",
            Status::Conflict => "conflict",
            Status::ServerError => "server-error",
        }
    }

    /// Parses a status token, defaulting to `ServerError` for anything unknown.
    ///
    /// A response parser is never allowed to fail on an unrecognized status; it
    /// just can't tell the caller anything more specific happened server-side.
    pub fn parse(s: &str) -> Status {
        match s {
            "ok" => Status::Ok,
            "created" => Status::Created,
            "not-modified" => Status::NotModified,
            "not-found" => Status::NotFound,
            "archived" => Status::Archived,
            "unauthorized" => Status::Unauthorized,
            "not-permitted" => Status::NotPermitted,
            "conflict" => Status::Conflict,
            _ => Status::ServerError,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_known_status() {
        for s in [
            Status::Ok,
            Status::Created,
            Status::NotModified,
            Status::NotFound,
            Status::Archived,
            Status::Unauthorized,
            Status::NotPermitted,
            Status::Conflict,
            Status::ServerError,
        ] {
            assert_eq!(Status::parse(s.as_str()), s);
        }
    }

    #[test]
    fn unknown_status_parses_as_server_error() {
        assert_eq!(Status::parse("banana"), Status::ServerError);
    }
}
