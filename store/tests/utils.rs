#![allow(dead_code)]

//Some more general testing utilities
use recstore_api::controller::Device;
use recstore_api::store::StoreSupport;
use recstore_api::types::Geometry;
use std::fs::{create_dir_all, remove_dir, remove_file};
use std::path::{Path, PathBuf};

//Create the necessary folders 'name' leading up to 'img_name', starting from the crate root
//Additionally, remove 'img_name' if it already exists in the file system, to make sure we can start from a fresh image
pub fn disk_prep_path(name: &str, img_name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push(name);
    path.push(img_name);

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

//Undo folder creation, including removing the parent
pub fn disk_unprep_path(path: &Path) {
    //Ensure that the file has been deleted before going on
    remove_file(path).unwrap();

    let parent = path.parent().unwrap();
    remove_dir(parent).unwrap(); //Safety; only remove if empty
}

//Destruct the given device and remove the parent directory that it was located in
pub fn disk_destruct(dev: Device) {
    let path = dev.device_path().to_owned();
    drop(dev); //Avoid the device holding a lock over this file
    disk_unprep_path(&path);
}

//Reopen the backing file of a store that was unmounted (and dropped) earlier
pub fn disk_open(path: &Path) -> Device {
    Device::load(path).unwrap()
}

//Create a fresh store of the given type over a fresh backing file
pub fn store_setup<S: StoreSupport>(path: &Path, geometry: &Geometry) -> S {
    S::mkstore(path, geometry).unwrap()
}

//Mount a store of the given type over an existing device
pub fn store_open<S: StoreSupport>(dev: Device, geometry: &Geometry) -> S {
    S::mountstore(dev, geometry).unwrap()
}

//Deterministic payload bytes, so content mismatches show up at any offset and
//any length
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31).wrapping_add(7)) as u8).collect()
}
