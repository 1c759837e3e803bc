use recstore::record_store::RecordStore;
use recstore_api::store::{RecordSupport, StoreSupport};
use recstore_api::types::Geometry;
use std::path::PathBuf;

#[path = "utils.rs"]
mod utils;

fn disk_prep_path(name: &str) -> PathBuf {
    utils::disk_prep_path(&("st-images-persist-".to_string() + name), "img")
}

#[test]
fn records_survive_a_reopen() -> anyhow::Result<()> {
    let path = disk_prep_path("reopen");
    let geometry = Geometry::default();
    let mut store: RecordStore = utils::store_setup(&path, &geometry);

    let small = utils::pattern(100);
    let large = utils::pattern(150_000);
    let id_small = store.r_create(&small)?;
    let id_large = store.r_create(&large)?;

    //Close the store completely, then open the same image again
    drop(store.unmountstore());
    let store: RecordStore = utils::store_open(utils::disk_open(&path), &geometry);

    assert_eq!(store.r_get(id_small)?, Some(small));
    assert_eq!(store.r_get(id_large)?, Some(large));

    utils::disk_destruct(store.unmountstore());
    Ok(())
}

#[test]
fn updates_and_the_queue_survive_a_reopen() {
    let path = disk_prep_path("queue");
    let geometry = Geometry::default();
    let mut store: RecordStore = utils::store_setup(&path, &geometry);

    //Leave the store with one live record and two freed blocks
    let id = store.r_create(&utils::pattern(100_000)).unwrap();
    store.r_update(id, &utils::pattern(77)).unwrap();
    let blocks_before = store.block_count();

    drop(store.unmountstore());
    let mut store: RecordStore = utils::store_open(utils::disk_open(&path), &geometry);

    //The shrunken record reads back, and the freed blocks are still on the
    //queue: a two-block record consumes them instead of growing the stream
    assert_eq!(store.r_get(id).unwrap(), Some(utils::pattern(77)));
    let second = store.r_create(&utils::pattern(80_000)).unwrap();
    assert_eq!(store.block_count(), blocks_before);
    assert_eq!(store.r_get(second).unwrap(), Some(utils::pattern(80_000)));

    utils::disk_destruct(store.unmountstore());
}

#[test]
fn deletions_survive_a_reopen() {
    let path = disk_prep_path("deleted");
    let geometry = Geometry::default();
    let mut store: RecordStore = utils::store_setup(&path, &geometry);

    let keep = store.r_create(&utils::pattern(42)).unwrap();
    let gone = store.r_create(&utils::pattern(43)).unwrap();
    store.r_delete(gone).unwrap();

    drop(store.unmountstore());
    let store: RecordStore = utils::store_open(utils::disk_open(&path), &geometry);

    assert_eq!(store.r_get(keep).unwrap(), Some(utils::pattern(42)));
    assert_eq!(store.r_get(gone).unwrap(), None);

    utils::disk_destruct(store.unmountstore());
}
