use log::debug;
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

pub struct FileLoader {}
impl FileLoader {
    pub fn open(file_path: &Path) -> io::Result<File> {
        File::open(file_path)
    }
    /// Reads the whole file. The handle is dropped before returning, on the
    /// error path as well.
    pub fn read_all(file_path: &Path) -> io::Result<Vec<u8>> {
        let mut file = Self::open(file_path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        debug!("read {} bytes from {}", buf.len(), file_path.display());
        Ok(buf)
    }
}

/// associating a extension with a enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum FileType {
    Pkl,
    Json,
    Obj,
    Npz,
    Unknown,
}
impl FileType {
    pub fn value(&self) -> &'static [&'static str] {
        match self {
            Self::Pkl => &["pkl", "pickle"],
            Self::Json => &["json"],
            Self::Obj => &["obj"],
            Self::Npz => &["npz"],
            Self::Unknown => &[""],
        }
    }
    pub fn find_match(ext: &str) -> Self {
        Self::iter()
            .find(|filetype| filetype.value().contains(&(ext.to_lowercase()).as_str()))
            .unwrap_or(FileType::Unknown)
    }
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(FileType::Unknown, Self::find_match)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_and_flush<E, F>(tmp_path: &Path, write: F) -> Result<(), E>
where
    E: From<io::Error>,
    F: FnOnce(&mut BufWriter<File>) -> Result<(), E>,
{
    let mut writer = BufWriter::new(File::create(tmp_path)?);
    write(&mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Writes through a temporary sibling file that is renamed onto ``path`` only
/// once ``write`` succeeded. On failure the temporary file is removed and
/// ``path`` is left untouched.
pub fn write_atomic<E, F>(path: &Path, write: F) -> Result<(), E>
where
    E: From<io::Error>,
    F: FnOnce(&mut BufWriter<File>) -> Result<(), E>,
{
    let tmp_path = tmp_sibling(path);
    let result = write_and_flush(&tmp_path, write).and_then(|()| fs::rename(&tmp_path, path).map_err(E::from));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
