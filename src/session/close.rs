//! WebSocket close codes reported to viewers

use std::fmt;

/// Close code sent when a viewer connection ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// The stream ended normally (1000)
    Normal,
    /// The session exists but cannot serve the viewer (1011)
    NotReady,
    /// No session with that id (4004, application range)
    NotFound,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::NotReady => 1011,
            CloseCode::NotFound => 4004,
        }
    }

    /// Short reason text for the close frame
    pub fn reason(&self) -> &'static str {
        match self {
            CloseCode::Normal => "stream ended",
            CloseCode::NotReady => "session not ready",
            CloseCode::NotFound => "session not found",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_values() {
        assert_eq!(CloseCode::Normal.code(), 1000);
        assert_eq!(CloseCode::NotReady.code(), 1011);
        assert_eq!(CloseCode::NotFound.code(), 4004);
        assert_eq!(CloseCode::NotFound.to_string(), "4004 (session not found)");
    }
}
