//! Implementation of the backing stream of a store and a simple controller for it.
//! The stream and its contents are represented by a file in your file system, that is memory mapped and stored in a `Device` struct.
//! When initializing the controller, you either provide a path to a non-existing file, which will be created empty and grown on demand, or a path to an existing file, the contents of which become the initial stream contents.
//! Provides random-access reads and writes at byte granularity, plus the ability to extend (or truncate) the stream; the block layer on top of this controller is what imposes a block structure on it.
//!
//! No provisions have been made to lock the backing file, so do not fiddle with it while a store is running on top of it. (e.g. the fs2 crate could be used to explicitly implement locking, if so desired)

use super::error;
use super::error::ApiError;
use memmap::{MmapMut, MmapOptions};
use std::{
    fs::{remove_file, File, OpenOptions},
    path::{Path, PathBuf},
};

/// Struct representing the state of the byte stream backing a store.
/// The implementation of this structure is the controller that allows the
/// block layer to read and write ranges of the stream, and to grow it one
/// block at a time.
///
/// In contrast to a fixed-size disk image, the stream starts out empty and is
/// extended explicitly through [`set_len`](#method.set_len). An empty stream
/// is a valid (empty) store. Because an empty file cannot be memory mapped,
/// the mapping is absent exactly when the stream length is 0.
#[derive(Debug)]
pub struct Device {
    /// Path to the file in your file system that is used as the backing area of this stream
    path: PathBuf,
    /// Handle to the backing file; kept open so the stream can be remapped after growing
    file: File,
    /// Current length of the stream, in bytes
    len: u64,
    /// Memory-mapped contents of the backing file; `None` iff `len == 0`
    contents: Option<MmapMut>,
}

/// Small enum, used to specify whether we expect to open a new stream
#[derive(PartialEq, Eq, Copy, Clone)]
pub enum DiskState {
    /// Creating a new backing file
    New,
    /// Loading an existing backing file
    Load,
}

// Import the components of this enum, so we can reuse them here
use self::DiskState::*;
impl DiskState {
    /// Convert a boolean to a `DiskState`
    pub fn new(ex: bool) -> DiskState {
        match ex {
            true => Load,
            false => New,
        }
    }
}

impl Drop for Device {
    /// This implementation of drop makes sure all writes are persisted at the end, before we release ownership of the controller
    /// We only need to persist these writes if the file backing this stream actually still exists
    fn drop(&mut self) {
        if self.path.exists() {
            if let Some(m) = &self.contents {
                let _ = m.flush();
            }
        }
    }
}

impl Device {
    /// Core function that handles both `new` and `load`, based on the value of the switch `ds`, representing whether we want to load or create a stream
    fn create_device<P: AsRef<Path>>(path: P, ds: DiskState) -> error::Result<Device> {
        let path_buf = path.as_ref().to_path_buf();
        let exists = DiskState::new(path.as_ref().exists());
        if exists != ds {
            if ds == Load {
                return Err(ApiError::ControllerInput(
                    "Tried to load a non-existing file path",
                ));
            } else {
                return Err(ApiError::ControllerInput(
                    "Tried to create a pre-existing file path",
                ));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let contents = map_file(&file, len)?;
        Ok(Device {
            path: path_buf,
            file,
            len,
            contents,
        })
    }

    /// Create a *new*, empty stream, given a `path` to store its backing file.
    /// This function will return an error if the file represented by `path` already exists.
    pub fn new<P: AsRef<Path>>(path: P) -> error::Result<Device> {
        Device::create_device(path, New)
    }

    /// Load an *existing* stream from its backing file.
    /// This function will return an error if the file represented by `path` does not yet exist.
    pub fn load<P: AsRef<Path>>(path: P) -> error::Result<Device> {
        Device::create_device(path, Load)
    }

    /// End the lifetime of this stream, and remove the file backing it on disk
    /// Assumes that you have not made any other links to the backing file
    /// Panics if removing the file fails
    pub fn destruct(self) {
        remove_file(&self.path).unwrap();
    }

    /// Current size of this stream in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Does this stream currently have length 0?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the file backing this stream
    pub fn device_path(&self) -> &Path {
        &self.path
    }

    /// Resize the stream to `new_len` bytes.
    /// Growing fills the new range with zeroes; shrinking discards the tail.
    /// The old mapping is flushed and dropped before the file is resized, and
    /// a fresh mapping is installed afterwards.
    pub fn set_len(&mut self, new_len: u64) -> error::Result<()> {
        if let Some(m) = &self.contents {
            m.flush()?;
        }
        //The old mapping must be gone before the file shrinks underneath it
        self.contents = None;
        self.file.set_len(new_len)?;
        self.contents = map_file(&self.file, new_len)?;
        self.len = new_len;
        Ok(())
    }

    /// Persist all outstanding writes to the backing file
    pub fn flush(&mut self) -> error::Result<()> {
        if let Some(m) = &self.contents {
            m.flush()?;
        }
        Ok(())
    }

    /// Read `data.len()` bytes from the stream starting at address `addr` into `data`
    /// Results in an error if a read past the end of the stream is attempted
    pub fn read(&self, addr: u64, data: &mut [u8]) -> error::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if addr + data.len() as u64 > self.len {
            return Err(ApiError::ControllerInput("Read past the end of the stream"));
        }
        let start = addr as usize;
        let end = start + data.len();
        match &self.contents {
            Some(m) => data.copy_from_slice(&m[start..end]),
            None => return Err(ApiError::ControllerInput("Read from an empty stream")),
        }
        Ok(())
    }

    /// Write the given buffer into the stream at address `addr`
    /// Fails if a write past the end of the stream is attempted; the stream
    /// only grows through `set_len`
    pub fn write(&mut self, addr: u64, data: &[u8]) -> error::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if addr + data.len() as u64 > self.len {
            return Err(ApiError::ControllerInput(
                "Write past the end of the stream",
            ));
        }
        let start = addr as usize;
        let end = start + data.len();
        match &mut self.contents {
            Some(m) => m[start..end].copy_from_slice(data),
            None => return Err(ApiError::ControllerInput("Write into an empty stream")),
        }
        Ok(())
    }
}

/// Map the given file, unless it is empty (an empty file cannot be mapped)
fn map_file(file: &File, len: u64) -> error::Result<Option<MmapMut>> {
    if len == 0 {
        return Ok(None);
    }
    let map = unsafe { MmapOptions::new().map_mut(file)? };
    Ok(Some(map))
}

// Here we define a submodule, called `tests`, that contains the unit tests of
// this module.
//
// The `#[cfg(test)]` annotation means that this code is only compiled when
// we're testing the code.
//
// Each test sets up its own uniquely named image directory, so that tests can
// run in parallel without sharing a backing file.
#[cfg(test)]
mod tests {

    use super::Device;
    use std::fs::{create_dir_all, remove_dir, remove_file};
    use std::path::PathBuf;

    //Returns the path to the image we will use during the tests
    //To avoid parallel tests from overlapping, each test passes in its own unique `name` string, so it gets access to its own resources.
    //Also creates any missing directories between this path and the current working directory
    //Additionally, removes the image file, if it happens to exist already
    fn disk_prep_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("st-images-controller-".to_string() + name);
        path.push("img");

        if path.exists() {
            //Remove the file in case it already exists
            remove_file(&path).unwrap();
        }
        {
            //Create any missing directories first, if applicable
            let prefix = path.parent().unwrap();
            create_dir_all(prefix).unwrap();
        }

        return path;
    }

    //Destruct the given device and remove the parent directory that it was located in
    fn disk_destruct(dev: Device) {
        let path = dev.device_path().to_owned();
        dev.destruct();
        remove_dir(path.parent().unwrap()).unwrap(); //Safety measure; will only delete an empty directory
    }

    #[test]
    fn create_device_test() {
        let path = disk_prep_path("create");
        let mut dev = Device::new(&path).unwrap();

        //A fresh stream is empty, and reads past the end fail
        assert_eq!(dev.len(), 0);
        assert!(dev.is_empty());
        let mut buf = [0; 4];
        assert!(dev.read(0, &mut buf).is_err());

        //Grow the stream and check that the new range reads back as zeroes
        dev.set_len(128).unwrap();
        assert_eq!(dev.len(), 128);
        dev.read(60, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);

        //Write some raw data and read it back, also straddling the write
        dev.write(10, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0; 6];
        dev.read(9, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 0]);

        //Reads and writes past the end of the stream fail
        assert!(dev.read(126, &mut buf).is_err());
        assert!(dev.write(126, &[0; 6]).is_err());
        //Zero-length accesses at the end are fine
        assert!(dev.read(128, &mut []).is_ok());
        assert!(dev.write(128, &[]).is_ok());

        //Creating a device over an existing path fails
        assert!(Device::new(&path).is_err());

        disk_destruct(dev);
        //Make sure the file has actually been destroyed
        assert!(!path.exists());
    }

    #[test]
    fn grow_and_reload_test() {
        let path = disk_prep_path("grow");
        let mut dev = Device::new(&path).unwrap();

        //Grow in two steps and write into both ranges
        dev.set_len(64).unwrap();
        dev.write(0, &[7; 8]).unwrap();
        dev.set_len(256).unwrap();
        dev.write(250, &[9; 6]).unwrap();
        assert_eq!(dev.len(), 256);

        //Data written before the grow survives the remap
        let mut buf = [0; 8];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf, [7; 8]);

        //Close the device by dropping it, then reopen it and check both writes
        drop(dev);
        let dev = Device::load(&path).unwrap();
        assert_eq!(dev.len(), 256);
        let mut buf = [0; 8];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf, [7; 8]);
        let mut buf = [0; 6];
        dev.read(250, &mut buf).unwrap();
        assert_eq!(buf, [9; 6]);

        //Loading a non-existing path fails
        assert!(Device::load(path.with_file_name("nope")).is_err());

        disk_destruct(dev);
        assert!(!path.exists());
    }
}
