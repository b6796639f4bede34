use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::debug;

/// Manages the on-disk life cycle of a download: one fragment file per
/// verified piece, merged into the final payload once every piece exists.
pub struct FileManager {
    download_dir: PathBuf,
    file_name: String,
}

impl FileManager {
    pub fn new(download_path: &str, file_name: &str) -> io::Result<Self> {
        let download_dir = PathBuf::from(download_path);

        // Create all directories if they do not exist
        fs::create_dir_all(&download_dir)?;

        Ok(Self {
            download_dir,
            file_name: file_name.to_string(),
        })
    }

    fn fragment_path(&self, piece_index: u32) -> PathBuf {
        self.download_dir
            .join(format!("{}.piece.{}", self.file_name, piece_index))
    }

    pub fn merged_path(&self) -> PathBuf {
        self.download_dir.join(&self.file_name)
    }

    pub fn save_piece(&self, piece_index: u32, bytes: &[u8]) -> Result<(), DiskError> {
        let path = self.fragment_path(piece_index);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(bytes)?;

        debug!(piece_index, path = %path.display(), "Successfully wrote piece fragment to disk");

        Ok(())
    }

    pub fn is_piece_downloaded(&self, piece_index: u32, piece_size: u64) -> bool {
        fs::metadata(self.fragment_path(piece_index))
            .map(|metadata| metadata.len() == piece_size)
            .unwrap_or(false)
    }

    /// Scans for fragments left behind by a previous run, so completed
    /// pieces are not downloaded again. A fragment whose size does not
    /// match its expected piece size is treated as absent.
    pub fn downloaded_pieces(&self, piece_sizes: &[u64]) -> Vec<u32> {
        (0..piece_sizes.len() as u32)
            .filter(|&piece_index| {
                self.is_piece_downloaded(piece_index, piece_sizes[piece_index as usize])
            })
            .collect()
    }

    pub fn is_merged(&self, total_length: u64) -> bool {
        fs::metadata(self.merged_path())
            .map(|metadata| metadata.len() == total_length)
            .unwrap_or(false)
    }

    /// Concatenates all piece fragments in index order into the final file
    /// and removes the fragments once the merged size checks out.
    pub fn merge(&self, piece_count: usize, total_length: u64) -> Result<(), DiskError> {
        if self.is_merged(total_length) {
            return Ok(());
        }

        let merged_path = self.merged_path();
        let mut output = File::create(&merged_path)?;

        for piece_index in 0..piece_count as u32 {
            let path = self.fragment_path(piece_index);
            let mut fragment = File::open(&path).map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DiskError::MissingFragment(piece_index)
                } else {
                    DiskError::Io(e)
                }
            })?;
            io::copy(&mut fragment, &mut output)?;
        }
        output.flush()?;

        let merged_size = fs::metadata(&merged_path)?.len();
        if merged_size != total_length {
            return Err(DiskError::SizeMismatch {
                expected: total_length,
                actual: merged_size,
            });
        }

        for piece_index in 0..piece_count as u32 {
            fs::remove_file(self.fragment_path(piece_index))?;
        }

        debug!(path = %merged_path.display(), size = merged_size, "Merged piece fragments into final file");

        Ok(())
    }
}

#[derive(Debug)]
pub enum DiskError {
    Io(io::Error),
    MissingFragment(u32),
    SizeMismatch { expected: u64, actual: u64 },
}

// Implement `std::fmt::Display` for `DiskError`
impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::Io(err) => write!(f, "IO error: {}", err),
            DiskError::MissingFragment(piece_index) => {
                write!(f, "Missing piece fragment {}", piece_index)
            }
            DiskError::SizeMismatch { expected, actual } => write!(
                f,
                "Merged file size mismatch: expected {} bytes, found {}",
                expected, actual
            ),
        }
    }
}

// Implement `std::error::Error` for `DiskError`
impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskError::Io(err) => Some(err),
            _ => None,
        }
    }
}

// Implement `From<io::Error>` for `DiskError`
impl From<io::Error> for DiskError {
    fn from(err: io::Error) -> Self {
        DiskError::Io(err)
    }
}
