//! Logical resource names and their per-format realization.
//!
//! A small closed set of identifiers shared by all three formats:
//!
//! | Logical name    | Mach-O                        | ELF note owner  | PE                         |
//! |-----------------|-------------------------------|-----------------|----------------------------|
//! | `NODE_SEA_BLOB` | `NODE_SEA`,`__NODE_SEA_BLOB`  | `NODE_SEA_BLOB` | RCDATA `NODE_SEA_BLOB`     |
//! | `SMOL_VFS_BLOB` | `NODE_SEA`,`__SMOL_VFS_BLOB`  | `SMOL_VFS_BLOB` | RCDATA `SMOL_VFS_BLOB`     |
//! | `pressed_data`  | `SMOL`,`__PRESSED_DATA`       | `pressed_data`  | section `.pressed_data`    |

/// A logical resource a binary can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Node single-executable-application blob.
    NodeSeaBlob,
    /// Virtual filesystem blob.
    SmolVfsBlob,
    /// Self-extracting compressed payload.
    PressedData,
}

impl Resource {
    /// All known resources, in listing order.
    pub const ALL: [Resource; 3] = [
        Resource::NodeSeaBlob,
        Resource::SmolVfsBlob,
        Resource::PressedData,
    ];

    /// Parse a logical name as it appears on the CLI.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "NODE_SEA_BLOB" => Some(Self::NodeSeaBlob),
            "SMOL_VFS_BLOB" => Some(Self::SmolVfsBlob),
            "pressed_data" => Some(Self::PressedData),
            _ => None,
        }
    }

    /// The logical name.
    pub fn logical_name(&self) -> &'static str {
        match self {
            Self::NodeSeaBlob => "NODE_SEA_BLOB",
            Self::SmolVfsBlob => "SMOL_VFS_BLOB",
            Self::PressedData => "pressed_data",
        }
    }

    /// Mach-O segment this resource lives in.
    pub fn macho_segment(&self) -> &'static str {
        match self {
            Self::NodeSeaBlob | Self::SmolVfsBlob => "NODE_SEA",
            Self::PressedData => "SMOL",
        }
    }

    /// Mach-O section name within [`Resource::macho_segment`].
    pub fn macho_section(&self) -> &'static str {
        match self {
            Self::NodeSeaBlob => "__NODE_SEA_BLOB",
            Self::SmolVfsBlob => "__SMOL_VFS_BLOB",
            Self::PressedData => "__PRESSED_DATA",
        }
    }

    /// ELF PT_NOTE owner name.
    pub fn elf_note_owner(&self) -> &'static str {
        self.logical_name()
    }

    /// PE RT_RCDATA resource name, when this resource is realized in the
    /// resource tree.
    pub fn pe_resource_name(&self) -> Option<&'static str> {
        match self {
            Self::NodeSeaBlob | Self::SmolVfsBlob => Some(self.logical_name()),
            Self::PressedData => None,
        }
    }

    /// PE section name, when this resource is realized as a section.
    pub fn pe_section_name(&self) -> Option<&'static str> {
        match self {
            Self::PressedData => Some(".pressed_data"),
            _ => None,
        }
    }

    /// Whether injecting this resource participates in the fuse policy.
    pub fn arms_fuse(&self) -> bool {
        matches!(self, Self::NodeSeaBlob | Self::SmolVfsBlob)
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.logical_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for r in Resource::ALL {
            assert_eq!(Resource::parse(r.logical_name()), Some(r));
        }
        assert_eq!(Resource::parse("SOMETHING_ELSE"), None);
    }

    #[test]
    fn test_per_format_names() {
        assert_eq!(Resource::NodeSeaBlob.macho_segment(), "NODE_SEA");
        assert_eq!(Resource::PressedData.macho_segment(), "SMOL");
        assert_eq!(Resource::PressedData.macho_section(), "__PRESSED_DATA");
        assert_eq!(Resource::PressedData.pe_resource_name(), None);
        assert_eq!(
            Resource::PressedData.pe_section_name(),
            Some(".pressed_data")
        );
        assert_eq!(
            Resource::SmolVfsBlob.pe_resource_name(),
            Some("SMOL_VFS_BLOB")
        );
    }
}
