use crate::error::{Result, SmuxError};

/// Frame commands.
///
/// `Upd` carries its window update inline; on the wire the two counters
/// travel as the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Nop,
    Syn,
    Fin,
    Psh,
    Upd { consumed: u32, window: u32 },
}

impl Command {
    pub const NOP: u8 = 0;
    pub const SYN: u8 = 1;
    pub const FIN: u8 = 2;
    pub const PSH: u8 = 3;
    pub const UPD: u8 = 4;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::NOP => Ok(Command::Nop),
            Self::SYN => Ok(Command::Syn),
            Self::FIN => Ok(Command::Fin),
            Self::PSH => Ok(Command::Psh),
            Self::UPD => Ok(Command::Upd {
                consumed: 0,
                window: 0,
            }),
            _ => Err(SmuxError::InvalidCommand(byte)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Command::Nop => Self::NOP,
            Command::Syn => Self::SYN,
            Command::Fin => Self::FIN,
            Command::Psh => Self::PSH,
            Command::Upd { .. } => Self::UPD,
        }
    }

    /// Everything except data frames. Control frames are written ahead of
    /// queued data.
    pub fn is_control(self) -> bool {
        !matches!(self, Command::Psh)
    }

    pub fn requires_v2(self) -> bool {
        matches!(self, Command::Upd { .. })
    }

    pub fn consumed(self) -> Option<u32> {
        match self {
            Command::Upd { consumed, .. } => Some(consumed),
            _ => None,
        }
    }

    pub fn window(self) -> Option<u32> {
        match self {
            Command::Upd { window, .. } => Some(window),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_values() {
        assert_eq!(Command::Nop.to_byte(), 0);
        assert_eq!(Command::Syn.to_byte(), 1);
        assert_eq!(Command::Fin.to_byte(), 2);
        assert_eq!(Command::Psh.to_byte(), 3);
        assert_eq!(
            Command::Upd {
                consumed: 1,
                window: 2
            }
            .to_byte(),
            4
        );

        assert_eq!(Command::from_byte(0).unwrap(), Command::Nop);
        assert_eq!(Command::from_byte(3).unwrap(), Command::Psh);
        assert!(matches!(
            Command::from_byte(4).unwrap(),
            Command::Upd { .. }
        ));
    }

    #[test]
    fn test_invalid_command_byte() {
        assert!(matches!(
            Command::from_byte(255),
            Err(SmuxError::InvalidCommand(255))
        ));
        assert!(matches!(
            Command::from_byte(5),
            Err(SmuxError::InvalidCommand(5))
        ));
    }

    #[test]
    fn test_command_properties() {
        assert!(Command::Syn.is_control());
        assert!(Command::Fin.is_control());
        assert!(Command::Nop.is_control());
        assert!(!Command::Psh.is_control());

        let upd = Command::Upd {
            consumed: 0,
            window: 0,
        };
        assert!(upd.is_control());
        assert!(upd.requires_v2());
        assert!(!Command::Psh.requires_v2());
        assert!(!Command::Nop.requires_v2());
    }

    #[test]
    fn test_upd_command_values() {
        let cmd = Command::Upd {
            consumed: 123,
            window: 456,
        };
        assert_eq!(cmd.consumed(), Some(123));
        assert_eq!(cmd.window(), Some(456));

        assert_eq!(Command::Syn.consumed(), None);
        assert_eq!(Command::Syn.window(), None);
    }
}
