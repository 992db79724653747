use evgate::persistence::PersistenceManager;
use evgate::session::SessionState;

fn path_in(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[test]
fn default_state_values() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = PersistenceManager::new(&path_in(&dir, "state.json"));
    let state = mgr.state();
    assert_eq!(state.mode, 0);
    assert_eq!(state.start_stop, 0);
    assert_eq!(state.set_current, 6.0);
}

#[test]
fn round_trip_preserves_session_and_intent() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_in(&dir, "state.json");

    let mut mgr = PersistenceManager::new(&path);
    mgr.set_mode(2);
    mgr.set_start_stop(1);
    mgr.set_set_current(11.5);
    mgr.set_insufficient_solar_start(1_700_000_000.0);
    mgr.set_session(SessionState::default());
    mgr.save().unwrap();

    let mut reloaded = PersistenceManager::new(&path);
    reloaded.load().unwrap();
    assert_eq!(reloaded.state().mode, 2);
    assert_eq!(reloaded.state().start_stop, 1);
    assert_eq!(reloaded.state().set_current, 11.5);
    assert_eq!(reloaded.state().insufficient_solar_start, 1_700_000_000.0);
}

#[test]
fn write_is_atomic_no_tmp_file_survives() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_in(&dir, "state.json");
    let mgr = PersistenceManager::new(&path);
    mgr.save().unwrap();
    assert!(std::path::Path::new(&path).exists());
    assert!(!std::path::Path::new(&path).with_extension("tmp").exists());
}

#[test]
fn unreadable_file_is_treated_as_empty_document_not_a_fatal_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = path_in(&dir, "state.json");
    std::fs::write(&path, "{ this is not valid json").unwrap();

    let mut mgr = PersistenceManager::new(&path);
    assert!(mgr.load().is_ok());
    assert_eq!(mgr.state().mode, 0);
}
