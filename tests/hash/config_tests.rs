// Tests for config module
// Settings file round trip and defaults

use std::fs;
use std::path::PathBuf;

use hashlookup::hash::{Classification, HashDbError, HashLookupSettings, HashSetInfo, SourceFormat};
use tempfile::TempDir;

#[test]
fn test_missing_settings_are_empty() {
    let dir = TempDir::new().unwrap();
    let settings = HashLookupSettings::load(&dir.path().join("none.toml")).unwrap();
    assert!(settings.hash_sets.is_empty());
}

#[test]
fn test_save_and_load_preserves_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("hash_lookup.toml");

    let mut keeper = HashSetInfo::local("Keeper", Classification::Notable, "/sets/keeper.hsh");
    keeper.format = Some(SourceFormat::Hashkeeper);
    keeper.notify_on_hit = Some(false);
    let mut nsrl = HashSetInfo::local("NSRL", Classification::Known, "/sets/NSRLFile.txt");
    nsrl.format = Some(SourceFormat::Nsrl);
    nsrl.read_only = true;
    let remote = HashSetInfo::remote("Shared", Classification::NoChange, 42, "1.0");

    let settings = HashLookupSettings {
        hash_sets: vec![keeper, nsrl, remote],
    };
    settings.save(&path).unwrap();
    assert!(!path.with_extension("toml.tmp").exists());

    let loaded = HashLookupSettings::load(&path).unwrap();
    assert_eq!(loaded, settings);
    assert_eq!(loaded.hash_sets[1].path, Some(PathBuf::from("/sets/NSRLFile.txt")));
    assert!(loaded.hash_sets[2].is_remote());
}

#[test]
fn test_hand_written_settings_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hash_lookup.toml");
    fs::write(
        &path,
        r#"
[[hash_set]]
name = "Bad stuff"
classification = "notable"
path = "/sets/bad.idx"

[[hash_set]]
name = "OS files"
classification = "known"
path = "/sets/os.idx"
notify_on_hit = true
search_enabled = false
"#,
    )
    .unwrap();

    let settings = HashLookupSettings::load(&path).unwrap();
    let bad = &settings.hash_sets[0];
    assert!(bad.search_enabled);
    assert!(!bad.read_only);
    assert!(bad.notify());

    let os = &settings.hash_sets[1];
    assert!(!os.search_enabled);
    // Known sets never notify
    assert!(!os.notify());
}

#[test]
fn test_invalid_settings_are_config_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hash_lookup.toml");
    fs::write(&path, "[[hash_set]]\nname = \"x\"\nclassification = \"suspicious\"\n").unwrap();
    let err = HashLookupSettings::load(&path).unwrap_err();
    assert!(matches!(err, HashDbError::ConfigError { .. }));
    assert!(err.to_string().contains("Suggestion"));
}
