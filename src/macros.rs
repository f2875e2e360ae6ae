//! Declarative macros for the protocol's tagged enumerations.

/// Defines the `CommandType` enum with explicit wire codes and a
/// fallible `from_u32` conversion for decoded frames.
#[macro_export]
macro_rules! define_command_type {
    ($($(#[$meta:meta])* $name:ident = $code:literal,)+) => {
        /// Command codes of the Tuya LAN protocol.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($(#[$meta])* $name = $code,)+
        }

        impl CommandType {
            /// Maps a decoded command code back to its variant.
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$name),)+
                    _ => None,
                }
            }
        }

        impl From<CommandType> for u32 {
            fn from(cmd: CommandType) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Defines the `Version` enum with its wire string and numeric value.
/// Parsing rejects any string outside the supported set.
#[macro_export]
macro_rules! define_version {
    ($($name:ident = ($str:literal, $val:literal),)+) => {
        /// Supported Tuya LAN protocol versions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($name,)+
        }

        impl Version {
            /// The version string as sent on the wire (e.g. "3.3").
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$name => $str,)+
                }
            }

            /// The three ASCII bytes of the version string.
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }

            /// Numeric value for ordering comparisons.
            pub fn val(&self) -> f32 {
                match self {
                    $(Self::$name => $val,)+
                }
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($str => Ok(Self::$name),)+
                    other => Err($crate::error::TuyaError::UnsupportedVersion(
                        other.to_string(),
                    )),
                }
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
