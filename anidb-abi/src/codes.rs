//! Enumerants crossing the boundary
//!
//! Every enum travels as a raw `i32`. Conversion back into Rust goes through
//! `TryFrom<i32>` so that a value the engine invented (or corrupted) is
//! reported instead of transmuted.

use thiserror::Error;

/// Raw integer that did not match any known enumerant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {enumeration} value {value}")]
pub struct UnknownEnumerant {
    pub enumeration: &'static str,
    pub value: i32,
}

macro_rules! abi_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $label:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// All enumerants in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Raw value as sent across the boundary
            pub const fn raw(self) -> i32 {
                self as i32
            }
        }

        impl TryFrom<i32> for $name {
            type Error = UnknownEnumerant;

            fn try_from(value: i32) -> Result<Self, UnknownEnumerant> {
                match value {
                    $( $value => Ok($name::$variant), )+
                    _ => Err(UnknownEnumerant { enumeration: $label, value }),
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value as i32
            }
        }
    };
}

abi_enum! {
    /// Result codes returned by every fallible entry point
    ResultCode as "result code" {
        Success = 0,
        InvalidHandle = 1,
        InvalidParameter = 2,
        FileNotFound = 3,
        Processing = 4,
        OutOfMemory = 5,
        Io = 6,
        Network = 7,
        Cancelled = 8,
        InvalidUtf8 = 9,
        VersionMismatch = 10,
        Timeout = 11,
        PermissionDenied = 12,
        Cache = 13,
        Busy = 14,
        Unknown = 99,
    }
}

abi_enum! {
    /// Hash algorithm identifiers
    HashAlgorithm as "hash algorithm" {
        Ed2k = 1,
        Crc32 = 2,
        Md5 = 3,
        Sha1 = 4,
        Tth = 5,
    }
}

abi_enum! {
    /// Per-file processing status
    Status as "status" {
        Pending = 0,
        Processing = 1,
        Completed = 2,
        Failed = 3,
        Cancelled = 4,
    }
}

abi_enum! {
    /// Kinds of callback accepted by `anidb_register_callback`
    CallbackKind as "callback kind" {
        Progress = 1,
        Error = 2,
        Completion = 3,
        Event = 4,
    }
}

abi_enum! {
    /// Discriminant of `anidb_event_t`
    EventKind as "event kind" {
        FileStart = 1,
        FileComplete = 2,
        HashStart = 3,
        HashComplete = 4,
        CacheHit = 5,
        CacheMiss = 6,
        NetworkStart = 7,
        NetworkComplete = 8,
        MemoryWarning = 9,
    }
}

abi_enum! {
    /// Where an identification came from
    IdentificationSource as "identification source" {
        RemoteDatabase = 0,
        Cache = 1,
        Filename = 2,
    }
}

impl HashAlgorithm {
    /// Size of the text buffer the engine writes for this algorithm,
    /// terminator included.
    pub const fn buffer_size(self) -> usize {
        match self {
            HashAlgorithm::Ed2k | HashAlgorithm::Md5 => 33,
            HashAlgorithm::Crc32 => 9,
            HashAlgorithm::Sha1 => 41,
            HashAlgorithm::Tth => 40,
        }
    }

    /// Number of characters in the rendered digest
    pub const fn text_len(self) -> usize {
        self.buffer_size() - 1
    }

    pub const fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Ed2k => "ED2K",
            HashAlgorithm::Crc32 => "CRC32",
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Tth => "TTH",
        }
    }

    /// TTH renders as base32, everything else as lowercase hex
    pub const fn is_base32(self) -> bool {
        matches!(self, HashAlgorithm::Tth)
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = UnknownEnumerant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashAlgorithm::ALL
            .iter()
            .copied()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(s))
            .ok_or(UnknownEnumerant {
                enumeration: "hash algorithm",
                value: -1,
            })
    }
}

impl Status {
    /// Completed, Failed and Cancelled never change again
    pub const fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

impl ResultCode {
    pub const fn is_success(self) -> bool {
        matches!(self, ResultCode::Success)
    }

    /// Static description, mirrored by `anidb_error_string`
    pub const fn description(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::InvalidHandle => "invalid handle",
            ResultCode::InvalidParameter => "invalid parameter",
            ResultCode::FileNotFound => "file not found",
            ResultCode::Processing => "processing error",
            ResultCode::OutOfMemory => "out of memory",
            ResultCode::Io => "I/O error",
            ResultCode::Network => "network error",
            ResultCode::Cancelled => "operation cancelled",
            ResultCode::InvalidUtf8 => "invalid text encoding",
            ResultCode::VersionMismatch => "ABI version mismatch",
            ResultCode::Timeout => "operation timed out",
            ResultCode::PermissionDenied => "permission denied",
            ResultCode::Cache => "cache error",
            ResultCode::Busy => "resource busy",
            ResultCode::Unknown => "unknown error",
        }
    }
}
