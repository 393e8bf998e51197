use std::cell;
use std::collections;
use std::fmt;
use std::fs;
use std::io;
use std::path;
use std::rc;

/// # File system interface
///
/// This is the OS interface through which the FileGraph creates, lists and deletes its backing
/// files. Memory mapping itself always goes through [`StandardFile`].
///
/// See: <https://www.sqlite.org/c3ref/vfs.html>
pub trait FileSystem {
  /// The type of errors that can occur when interacting with this file system.
  type Error: fmt::Debug + fmt::Display;

  /// The type of files that this file system uses.
  type File: File<Error = Self::Error>;

  /// Opens a file at the given `path`, creating it if it does not exist.
  fn open(&mut self, path: &path::Path) -> Result<Self::File, Self::Error>;

  /// Deletes the file at the given `path`.
  fn delete(&mut self, path: &path::Path) -> Result<(), Self::Error>;

  /// Returns whether a file exists at the given `path`.
  fn exists(&mut self, path: &path::Path) -> Result<bool, Self::Error>;

  /// Lists the files directly inside the directory `dir`.
  fn list(&mut self, dir: &path::Path) -> Result<Vec<path::PathBuf>, Self::Error>;
}

/// # File interface
///
/// See: <https://www.sqlite.org/c3ref/io_methods.html>
pub trait File {
  /// The type of errors that can occur when interacting with this file.
  type Error: fmt::Debug + fmt::Display;

  /// Returns the size of the file in bytes.
  fn size(&mut self) -> Result<u64, Self::Error>;

  /// Sets the size of the file in bytes. New bytes read as zero.
  fn truncate(&mut self, size: u64) -> Result<(), Self::Error>;

  /// Reads exactly `buf.len()` bytes from the file at the given `offset`.
  fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Self::Error>;

  /// Writes `buf` to the file at the given `offset`.
  fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), Self::Error>;

  /// Flushes any buffered data to the file.
  fn sync(&mut self) -> Result<(), Self::Error>;

  /// Tries locking the file exclusively without blocking. Returns `false` if another handle
  /// already holds the lock.
  fn try_lock(&mut self) -> Result<bool, Self::Error>;

  /// Unlocks the file.
  fn unlock(&mut self) -> Result<(), Self::Error>;
}

/// # The primary implementation for [`FileSystem`]
///
/// This is simply a wrapper around [`std::fs`].
#[derive(Debug, Clone, Copy)]
pub struct StandardFileSystem;

/// Public constructor for [`StandardFileSystem`].
impl Default for StandardFileSystem {
  fn default() -> Self {
    StandardFileSystem
  }
}

impl FileSystem for StandardFileSystem {
  type Error = io::Error;
  type File = StandardFile;

  fn open(&mut self, path: &path::Path) -> Result<Self::File, Self::Error> {
    let file = fs::OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
    Ok(Self::File::from(file))
  }

  fn delete(&mut self, path: &path::Path) -> Result<(), Self::Error> {
    fs::remove_file(path)
  }

  fn exists(&mut self, path: &path::Path) -> Result<bool, Self::Error> {
    path.try_exists()
  }

  fn list(&mut self, dir: &path::Path) -> Result<Vec<path::PathBuf>, Self::Error> {
    let mut result = Vec::new();
    for entry in fs::read_dir(dir)? {
      let entry = entry?;
      if entry.file_type()?.is_file() {
        result.push(entry.path());
      }
    }
    Ok(result)
  }
}

/// # The primary implementation for [`File`]
///
/// This is simply a wrapper around [`std::fs::File`].
#[derive(Debug)]
pub struct StandardFile(fs::File);

/// Public constructor for [`StandardFile`].
impl From<fs::File> for StandardFile {
  fn from(file: fs::File) -> Self {
    Self(file)
  }
}

impl StandardFile {
  /// The underlying OS file, for memory mapping.
  pub fn as_file(&self) -> &fs::File {
    let StandardFile(inner) = self;
    inner
  }
}

impl File for StandardFile {
  type Error = io::Error;

  fn size(&mut self) -> Result<u64, Self::Error> {
    let StandardFile(inner) = self;
    Ok(inner.metadata()?.len())
  }

  fn truncate(&mut self, size: u64) -> Result<(), Self::Error> {
    let StandardFile(inner) = self;
    fs::File::set_len(inner, size)
  }

  fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
    let StandardFile(inner) = self;
    io::Seek::seek(inner, io::SeekFrom::Start(offset))?;
    io::Read::read_exact(inner, buf)
  }

  fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), Self::Error> {
    let StandardFile(inner) = self;
    io::Seek::seek(inner, io::SeekFrom::Start(offset))?;
    io::Write::write_all(inner, buf)
  }

  fn sync(&mut self) -> Result<(), Self::Error> {
    let StandardFile(inner) = self;
    fs::File::sync_all(inner)
  }

  fn try_lock(&mut self) -> Result<bool, Self::Error> {
    let StandardFile(inner) = self;
    match fs2::FileExt::try_lock_exclusive(inner) {
      Ok(()) => Ok(true),
      Err(err)
        if err.kind() == io::ErrorKind::WouldBlock
          || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
      {
        Ok(false)
      }
      Err(err) => Err(err),
    }
  }

  fn unlock(&mut self) -> Result<(), Self::Error> {
    let StandardFile(inner) = self;
    fs2::FileExt::unlock(inner)
  }
}

#[derive(Debug, Default)]
pub struct MemoryFileData {
  data: Vec<u8>,
  locked: bool,
}

type MemoryFiles = collections::HashMap<path::PathBuf, rc::Rc<cell::RefCell<MemoryFileData>>>;

/// In-memory implementation for [`FileSystem`]
///
/// Each file is represented by a byte vector and a boolean indicating whether the file is locked.
/// Clones share the same set of files, so a store can be closed and reopened against the same
/// contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
  files: rc::Rc<cell::RefCell<MemoryFiles>>,
}

fn not_found(path: &path::Path) -> io::Error {
  io::Error::new(io::ErrorKind::NotFound, format!("{} does not exist", path.display()))
}

fn normalize_dir(dir: &path::Path) -> &path::Path {
  if dir.as_os_str().is_empty() {
    path::Path::new(".")
  } else {
    dir
  }
}

impl FileSystem for MemoryFileSystem {
  type Error = io::Error;
  type File = MemoryFile;

  fn open(&mut self, path: &path::Path) -> Result<Self::File, Self::Error> {
    let mut files = self.files.borrow_mut();
    let file = files.entry(path.to_path_buf()).or_default();
    Ok(file.clone().into())
  }

  fn delete(&mut self, path: &path::Path) -> Result<(), Self::Error> {
    let file = self.files.borrow_mut().remove(path);
    file.map(|_| ()).ok_or_else(|| not_found(path))
  }

  fn exists(&mut self, path: &path::Path) -> Result<bool, Self::Error> {
    Ok(self.files.borrow().contains_key(path))
  }

  fn list(&mut self, dir: &path::Path) -> Result<Vec<path::PathBuf>, Self::Error> {
    let dir = normalize_dir(dir);
    let files = self.files.borrow();
    let result = files
      .keys()
      .filter(|path| path.parent().map(normalize_dir) == Some(dir))
      .cloned()
      .collect();
    Ok(result)
  }
}

/// In-memory implementation for [`File`]
#[derive(Debug)]
pub struct MemoryFile {
  file: rc::Rc<cell::RefCell<MemoryFileData>>,
}

/// Public constructor for [`MemoryFile`].
impl From<rc::Rc<cell::RefCell<MemoryFileData>>> for MemoryFile {
  fn from(file: rc::Rc<cell::RefCell<MemoryFileData>>) -> Self {
    MemoryFile { file }
  }
}

fn to_usize(x: u64) -> Result<usize, io::Error> {
  usize::try_from(x).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

impl File for MemoryFile {
  type Error = io::Error;

  fn size(&mut self) -> Result<u64, Self::Error> {
    Ok(self.file.borrow().data.len() as u64)
  }

  fn truncate(&mut self, size: u64) -> Result<(), Self::Error> {
    let size = to_usize(size)?;
    self.file.borrow_mut().data.resize(size, 0);
    Ok(())
  }

  fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
    let offset = to_usize(offset)?;
    let file = self.file.borrow();
    if offset + buf.len() > file.data.len() {
      return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    buf.copy_from_slice(&file.data[offset..offset + buf.len()]);
    Ok(())
  }

  fn write(&mut self, offset: u64, buf: &[u8]) -> Result<(), Self::Error> {
    let offset = to_usize(offset)?;
    let mut file = self.file.borrow_mut();
    if offset + buf.len() > file.data.len() {
      file.data.resize(offset + buf.len(), 0);
    }
    file.data[offset..offset + buf.len()].copy_from_slice(buf);
    Ok(())
  }

  fn sync(&mut self) -> Result<(), Self::Error> {
    Ok(())
  }

  fn try_lock(&mut self) -> Result<bool, Self::Error> {
    let mut file = self.file.borrow_mut();
    if file.locked {
      Ok(false)
    } else {
      file.locked = true;
      Ok(true)
    }
  }

  fn unlock(&mut self) -> Result<(), Self::Error> {
    let mut file = self.file.borrow_mut();
    if file.locked {
      file.locked = false;
      Ok(())
    } else {
      Err(io::Error::new(io::ErrorKind::InvalidInput, "file is not locked"))
    }
  }
}
