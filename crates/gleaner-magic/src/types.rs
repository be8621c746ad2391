use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    Unknown,
    Par2,
    Rar,
    Nfo,
    Sfv,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileType::Unknown => "Unknown file type",
            FileType::Par2 => "Par 2.0",
            FileType::Rar => "RAR Archive",
            FileType::Nfo => "NFO",
            FileType::Sfv => "SFV",
        };
        f.write_str(name)
    }
}

/// Something whose detected file type can be read and upgraded, typically
/// a download file whose subject classification turned out to be wrong.
pub trait FileTyper: Send + Sync {
    fn file_type(&self) -> FileType;
    fn set_file_type(&self, t: FileType);
}
