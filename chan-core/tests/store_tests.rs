use chan_core::{ChanStore, Loadable, Pin};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "chanwatch_store_{name}_{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    dir
}

#[tokio::test]
async fn loadables_are_coalesced_by_identity() {
    let dir = temp_dir("coalesce");
    let store = ChanStore::load_from_dir(&dir).await;

    let first = store.get_or_create(&Loadable::for_thread(0, "g", 42)).await;
    let mut titled = Loadable::for_thread(0, "g", 42);
    titled.title = "different title, same thread".into();
    let second = store.get_or_create(&titled).await;
    let other = store.get_or_create(&Loadable::for_thread(0, "a", 42)).await;

    assert_eq!(first.id, Some(1));
    assert_eq!(second.id, first.id);
    assert_eq!(other.id, Some(2));
    assert_eq!(store.list_loadables().await.len(), 2);

    let catalog = store.get_or_create(&Loadable::for_catalog(0, "g")).await;
    assert_eq!(catalog.id, None);
    assert_eq!(store.list_loadables().await.len(), 2);

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn loadables_and_pins_persist_across_reloads() {
    let dir = temp_dir("persist");
    let store = ChanStore::load_from_dir(&dir).await;

    let mut loadable = store.get_or_create(&Loadable::for_thread(0, "g", 7)).await;
    loadable.title = "Saved title".into();
    loadable.list_view_index = 12;
    store.update_loadable(&loadable).await;

    let mut pin = Pin::new(1, loadable.clone());
    pin.watch_last_count = 4;
    pin.watch_new_count = Some(6);
    store.save_pins(&[pin]).await;

    let reloaded = ChanStore::load_from_dir(&dir).await;
    let loadables = reloaded.list_loadables().await;
    assert_eq!(loadables.len(), 1);
    assert_eq!(loadables[0].title, "Saved title");
    assert_eq!(loadables[0].list_view_index, 12);

    let pins = reloaded.load_pins().await;
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].new_post_count(), 2);

    // Ids keep counting after a reload.
    let next = reloaded.get_or_create(&Loadable::for_thread(0, "g", 8)).await;
    assert_eq!(next.id, Some(2));

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn load_uses_tmp_fallback_on_corrupted_json() {
    let dir = temp_dir("corrupt");
    tokio::fs::create_dir_all(&dir).await.unwrap();

    tokio::fs::write(dir.join("loadables.json"), b"{ this is not json ").await.unwrap();
    let mut loadable = Loadable::for_thread(0, "g", 99);
    loadable.id = Some(5);
    let tmp = serde_json::json!({ "next_id": 6, "loadables": [loadable] });
    tokio::fs::write(dir.join("loadables.json.tmp"), serde_json::to_vec(&tmp).unwrap())
        .await
        .unwrap();

    tokio::fs::write(dir.join("pins.json"), b"[{ broken").await.unwrap();

    let store = ChanStore::load_from_dir(&dir).await;
    let loadables = store.list_loadables().await;
    assert_eq!(loadables.len(), 1, "should fall back to tmp file when main is corrupted");
    assert_eq!(loadables[0].id, Some(5));
    assert!(store.load_pins().await.is_empty());

    let created = store.get_or_create(&Loadable::for_thread(0, "g", 100)).await;
    assert_eq!(created.id, Some(6));

    let _ = tokio::fs::remove_dir_all(&dir).await;
}

#[tokio::test]
async fn load_recovers_tmp_copy_when_main_file_is_missing() {
    let dir = temp_dir("missing_main");
    tokio::fs::create_dir_all(&dir).await.unwrap();

    let mut pin = Pin::new(3, Loadable::for_thread(0, "g", 12));
    pin.watch_last_count = 7;
    tokio::fs::write(dir.join("pins.json.tmp"), serde_json::to_vec(&vec![pin]).unwrap())
        .await
        .unwrap();
    tokio::fs::write(dir.join("loadables.json.tmp"), b"not json either").await.unwrap();

    let store = ChanStore::load_from_dir(&dir).await;
    let pins = store.load_pins().await;
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].id, 3);
    assert_eq!(pins[0].watch_last_count, 7);
    assert!(store.list_loadables().await.is_empty());

    let _ = tokio::fs::remove_dir_all(&dir).await;
}
