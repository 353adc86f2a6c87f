use super::*;
use pkgmgr_core::{
    CertificateSet, DomainVerificationStatus, PermissionDeclaration, PermissionFlags,
    ProtectionLevel, SYSTEM_USER,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEST_REGISTRY_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[test]
fn app_ids_start_at_first_application_uid_and_are_reused() {
    let mut settings = Settings::new();
    let first = settings
        .acquire_app_id(AppIdOwner::Package("com.example.a".to_string()))
        .expect("must allocate");
    let second = settings
        .acquire_app_id(AppIdOwner::Package("com.example.b".to_string()))
        .expect("must allocate");
    assert_eq!(first, FIRST_APPLICATION_UID);
    assert_eq!(second, FIRST_APPLICATION_UID + 1);

    settings.insert_entry(entry("com.example.a", first));
    let removed = settings
        .remove_entry("com.example.a")
        .expect("must remove entry");
    assert_eq!(removed.freed_app_id, Some(first));

    let reused = settings
        .acquire_app_id(AppIdOwner::Package("com.example.c".to_string()))
        .expect("must allocate");
    assert_eq!(reused, first);
}

#[test]
fn register_app_id_rejects_foreign_owner() {
    let mut settings = Settings::new();
    assert!(settings.register_app_id(10_050, AppIdOwner::Package("com.example.a".to_string())));
    assert!(settings.register_app_id(10_050, AppIdOwner::Package("com.example.a".to_string())));
    assert!(!settings.register_app_id(10_050, AppIdOwner::Shared("com.example.shared".to_string())));
}

#[test]
fn shared_identity_keeps_app_id_until_last_member_leaves() {
    let mut settings = Settings::new();
    let app_id = settings
        .get_or_create_shared_user("com.example.shared")
        .expect("must create shared identity")
        .app_id;

    let mut first = entry("com.example.a", app_id);
    first.shared_user = Some("com.example.shared".to_string());
    let mut second = entry("com.example.b", app_id);
    second.shared_user = Some("com.example.shared".to_string());
    settings.insert_entry(first);
    settings.insert_entry(second);

    let removed = settings.remove_entry("com.example.a").expect("must remove");
    assert_eq!(removed.freed_app_id, None);
    assert!(settings.shared_user("com.example.shared").is_some());

    let removed = settings.remove_entry("com.example.b").expect("must remove");
    assert_eq!(removed.freed_app_id, Some(app_id));
    assert!(settings.shared_user("com.example.shared").is_none());
    assert!(settings.app_id_owner(app_id).is_none());
}

#[test]
fn shared_members_resolve_to_shared_permissions() {
    let mut settings = Settings::new();
    let app_id = settings
        .get_or_create_shared_user("com.example.shared")
        .expect("must create shared identity")
        .app_id;
    let mut member = entry("com.example.a", app_id);
    member.shared_user = Some("com.example.shared".to_string());
    member.requested_permissions = vec!["android.permission.INTERNET".to_string()];
    settings.insert_entry(member);

    settings
        .permissions_mut("com.example.a")
        .expect("must resolve holder")
        .grant_install("android.permission.INTERNET");
    settings
        .permissions_mut("com.example.a")
        .expect("must resolve holder")
        .grant_install("android.permission.CAMERA");

    let shared = settings
        .shared_user("com.example.shared")
        .expect("shared identity must exist");
    assert!(shared
        .permissions
        .has_install_permission("android.permission.INTERNET"));

    let revoked = settings.prune_shared_user_permissions("com.example.shared");
    assert_eq!(revoked, vec!["android.permission.CAMERA"]);
    let permissions = settings
        .permissions("com.example.a")
        .expect("must resolve holder");
    assert!(permissions.has_install_permission("android.permission.INTERNET"));
    assert!(!permissions.has_install_permission("android.permission.CAMERA"));
}

#[test]
fn disable_and_enable_system_package_round_trips_factory_entry() {
    let mut settings = Settings::new();
    let mut factory = entry("com.example.clock", 10_010);
    factory.flags.system = true;
    factory.version_code = 1;
    factory.code_path = PathBuf::from("/system/app/clock");
    settings.insert_entry(factory);

    assert!(settings.disable_system_package("com.example.clock"));
    assert!(!settings.disable_system_package("com.example.clock"));

    let update = settings
        .package_mut("com.example.clock")
        .expect("entry must exist");
    assert!(update.flags.updated_system);
    update.version_code = 2;
    update.code_path = PathBuf::from("/data/app/clock-1");
    update.user_state_mut(SYSTEM_USER).hidden = true;
    update.permissions.grant_runtime("android.permission.CAMERA", SYSTEM_USER);

    let restored = settings
        .enable_system_package("com.example.clock")
        .expect("factory entry must come back");
    assert_eq!(restored.version_code, 1);
    assert_eq!(restored.code_path, PathBuf::from("/system/app/clock"));
    assert!(!restored.flags.updated_system);
    assert!(restored
        .user_state(SYSTEM_USER)
        .expect("user state must carry over")
        .hidden);
    assert!(restored
        .permissions
        .has_runtime_permission("android.permission.CAMERA", SYSTEM_USER));
    assert!(settings
        .disabled_system_package("com.example.clock")
        .is_none());
}

#[test]
fn removing_update_keeps_app_id_held_by_factory_record() {
    let mut settings = Settings::new();
    let mut factory = entry("com.example.clock", 10_010);
    factory.flags.system = true;
    settings.insert_entry(factory);
    settings.disable_system_package("com.example.clock");

    let removed = settings
        .remove_entry("com.example.clock")
        .expect("must remove update");
    assert_eq!(removed.freed_app_id, None);
}

#[test]
fn define_permission_rejects_foreign_owner() {
    let mut settings = Settings::new();
    settings
        .define_permission("com.example.a", declaration("com.example.READ"))
        .expect("must define");
    settings
        .define_permission("com.example.a", declaration("com.example.READ"))
        .expect("owner may redefine");
    let owner = settings
        .define_permission("com.example.b", declaration("com.example.READ"))
        .expect_err("other owner must be rejected");
    assert_eq!(owner, "com.example.a");

    assert_eq!(
        settings.remove_permission_definitions("com.example.a"),
        vec!["com.example.READ"]
    );
    assert!(settings.permission_definition("com.example.READ").is_none());
}

#[test]
fn authority_owner_finds_provider() {
    let mut settings = Settings::new();
    let mut provider = entry("com.example.a", 10_001);
    provider.provider_authorities = vec!["com.example.a.data".to_string()];
    settings.insert_entry(provider);
    assert_eq!(
        settings.authority_owner("com.example.a.data"),
        Some("com.example.a")
    );
    assert_eq!(settings.authority_owner("com.example.b.data"), None);
}

#[test]
fn add_user_installs_only_factory_packages() {
    let mut settings = Settings::new();
    let mut factory = entry("com.example.clock", 10_010);
    factory.flags.system = true;
    settings.insert_entry(factory);
    settings.insert_entry(entry("com.example.notes", 10_011));

    assert!(settings.add_user(10));
    assert!(!settings.add_user(10));
    assert!(settings
        .package("com.example.clock")
        .expect("must exist")
        .is_installed_for(10));
    assert!(!settings
        .package("com.example.notes")
        .expect("must exist")
        .is_installed_for(10));

    assert!(settings.remove_user(10));
    assert!(!settings.remove_user(SYSTEM_USER));
    assert_eq!(settings.users(), vec![SYSTEM_USER]);
}

#[test]
fn runtime_grant_flags_and_user_reset() {
    let mut state = PermissionsState::default();
    assert!(state.grant_runtime("android.permission.CAMERA", 0));
    assert!(!state.grant_runtime("android.permission.CAMERA", 0));
    state.update_runtime_flags(
        "android.permission.CAMERA",
        0,
        PermissionFlags::USER_CHANGES,
        PermissionFlags::USER_SET,
    );
    state.grant_runtime("android.permission.LOCATION", 0);
    state.update_runtime_flags(
        "android.permission.LOCATION",
        0,
        PermissionFlags::POLICY_FIXED,
        PermissionFlags::POLICY_FIXED,
    );

    assert_eq!(
        state.flags("android.permission.CAMERA", 0),
        PermissionFlags::USER_SET
    );
    assert!(!state.has_runtime_permission("android.permission.CAMERA", 10));

    let revoked = state.reset_runtime_user_changes(0);
    assert_eq!(revoked, vec!["android.permission.CAMERA"]);
    assert!(state.flags("android.permission.CAMERA", 0).is_empty());
    assert!(state.has_runtime_permission("android.permission.LOCATION", 0));
}

#[test]
fn gids_follow_granted_permissions() {
    let mut settings = Settings::new();
    let mut net = declaration("android.permission.INTERNET");
    net.gids = vec![3003];
    settings
        .define_permission("android", net)
        .expect("must define");

    let mut state = PermissionsState::default();
    assert!(state.gids(0, settings.permission_definitions()).is_empty());
    state.grant_install("android.permission.INTERNET");
    assert_eq!(
        state
            .gids(0, settings.permission_definitions())
            .into_iter()
            .collect::<Vec<_>>(),
        vec![3003]
    );
}

#[test]
fn store_round_trips_settings_and_user_files() {
    let root = test_registry_root();
    let store = RegistryStore::new(&root);

    let mut settings = Settings::new();
    settings.add_user(10);
    let app_id = settings
        .acquire_app_id(AppIdOwner::Package("com.example.notes".to_string()))
        .expect("must allocate");
    let mut notes = entry("com.example.notes", app_id);
    notes.certificates = CertificateSet::new(["aa"]);
    notes.user_state_mut(SYSTEM_USER).installed = true;
    notes.user_state_mut(SYSTEM_USER).domain_verification = DomainVerificationStatus::Always;
    notes.user_state_mut(10).installed = false;
    notes.permissions.grant_install("android.permission.INTERNET");
    notes
        .permissions
        .grant_runtime("android.permission.CAMERA", SYSTEM_USER);
    settings.insert_entry(notes);
    settings.record_rename("com.example.notes", "com.example.oldnotes");
    settings.expect_better("com.example.clock", &PathBuf::from("/system/app/clock"));
    settings.schedule_cleanup(CleanupRecord {
        name: "com.example.gone".to_string(),
        user: None,
        code_path: Some(PathBuf::from("/data/app/gone-1")),
        keep_data: false,
    });

    store.save(&settings).expect("must save settings");
    assert!(root.join(SETTINGS_FILE).is_file());
    assert!(root
        .join("users/10")
        .join(PACKAGE_RESTRICTIONS_FILE)
        .is_file());

    let (loaded, report) = store.load().expect("must load settings");
    assert!(!report.fresh);
    assert_eq!(report.migrated_from, None);
    assert_eq!(loaded.users(), vec![SYSTEM_USER, 10]);
    let notes = loaded
        .package("com.example.notes")
        .expect("entry must survive reload");
    assert!(notes.is_installed_for(SYSTEM_USER));
    assert!(!notes.is_installed_for(10));
    assert_eq!(
        loaded.domain_verification_status("com.example.notes", SYSTEM_USER),
        Some(DomainVerificationStatus::Always)
    );
    assert!(notes
        .permissions
        .has_install_permission("android.permission.INTERNET"));
    assert!(notes
        .permissions
        .has_runtime_permission("android.permission.CAMERA", SYSTEM_USER));
    assert_eq!(
        loaded.app_id_owner(app_id),
        Some(&AppIdOwner::Package("com.example.notes".to_string()))
    );
    assert_eq!(
        loaded.renamed_from("com.example.notes"),
        Some("com.example.oldnotes")
    );
    assert!(loaded.expecting_better("com.example.clock").is_some());
    assert_eq!(loaded.packages_to_clean().len(), 1);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn component_sets_survive_in_package_restrictions() {
    let root = test_registry_root();
    let store = RegistryStore::new(&root);

    let mut settings = Settings::new();
    settings.add_user(10);
    let app_id = settings
        .acquire_app_id(AppIdOwner::Package("com.example.notes".to_string()))
        .expect("must allocate");
    let mut notes = entry("com.example.notes", app_id);
    notes.user_state_mut(SYSTEM_USER).installed = true;
    let state = notes.user_state_mut(10);
    state.installed = true;
    state.disabled_components.insert("Sync".to_string());
    state.protected_components.insert("Settings".to_string());
    state.visible_components.insert("Viewer".to_string());
    settings.insert_entry(notes);

    store.save(&settings).expect("must save settings");
    let (loaded, _) = store.load().expect("must load settings");
    let notes = loaded
        .package("com.example.notes")
        .expect("entry must survive reload");
    let state = notes.user_state(10).expect("must keep user 10 state");
    assert_eq!(state.disabled_components, BTreeSet::from(["Sync".to_string()]));
    assert_eq!(state.protected_components, BTreeSet::from(["Settings".to_string()]));
    assert_eq!(state.visible_components, BTreeSet::from(["Viewer".to_string()]));
    let owner = notes.user_state(SYSTEM_USER).expect("must keep owner state");
    assert!(owner.protected_components.is_empty());
    assert!(owner.visible_components.is_empty());

    let legacy: UserState =
        serde_json::from_str(r#"{"installed": true, "disabled_components": ["Sync"]}"#)
            .expect("must read state written before component visibility existed");
    assert!(legacy.protected_components.is_empty());
    assert!(legacy.visible_components.is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn store_load_without_settings_is_fresh() {
    let root = test_registry_root();
    let store = RegistryStore::new(&root);
    let (settings, report) = store.load().expect("must load");
    assert!(report.fresh);
    assert_eq!(settings.package_names(), Vec::<String>::new());
    let _ = fs::remove_dir_all(&root);
}

#[test]
fn store_migrates_legacy_settings_forward() {
    let root = test_registry_root();
    fs::create_dir_all(&root).expect("must create root");
    let legacy = serde_json::json!({
        "packages": [{
            "name": "com.example.old",
            "app_id": 10000,
            "code_path": "/data/app/old-1",
            "resource_path": "/data/app/old-1",
            "version_code": 3,
            "target_sdk": 22
        }]
    });
    fs::write(
        root.join(SETTINGS_FILE),
        serde_json::to_vec(&legacy).expect("must encode"),
    )
    .expect("must write legacy settings");

    let store = RegistryStore::new(&root);
    let (settings, report) = store.load().expect("legacy settings must load");
    assert_eq!(report.migrated_from, Some(DatabaseVersion::First.number()));
    let entry = settings
        .package("com.example.old")
        .expect("legacy entry must load");
    assert!(entry.needs_certificate_recollection);
    assert!(entry.is_installed_for(SYSTEM_USER));
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.contains("no recorded certificates")));

    store.save(&settings).expect("must save migrated settings");
    let written = fs::read_to_string(root.join(SETTINGS_FILE)).expect("must read settings");
    let value: serde_json::Value = serde_json::from_str(&written).expect("must be json");
    assert_eq!(
        value.get("version").and_then(serde_json::Value::as_u64),
        Some(u64::from(DatabaseVersion::CURRENT.number()))
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn store_rejects_future_settings_version() {
    let root = test_registry_root();
    fs::create_dir_all(&root).expect("must create root");
    fs::write(root.join(SETTINGS_FILE), r#"{"version": 99}"#).expect("must write");

    let err = RegistryStore::new(&root)
        .load()
        .expect_err("future version must fail");
    let chain = err
        .chain()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ");
    assert!(
        chain.contains("unsupported settings version 99"),
        "unexpected error: {chain}"
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn store_drops_entries_with_conflicting_app_ids() {
    let root = test_registry_root();
    fs::create_dir_all(&root).expect("must create root");
    let conflicting = serde_json::json!({
        "version": 3,
        "packages": [
            {
                "name": "com.example.a",
                "app_id": 10000,
                "code_path": "/data/app/a-1",
                "resource_path": "/data/app/a-1",
                "version_code": 1,
                "target_sdk": 30,
                "certificates": ["aa"]
            },
            {
                "name": "com.example.b",
                "app_id": 10000,
                "code_path": "/data/app/b-1",
                "resource_path": "/data/app/b-1",
                "version_code": 1,
                "target_sdk": 30,
                "certificates": ["bb"]
            }
        ]
    });
    fs::write(
        root.join(SETTINGS_FILE),
        serde_json::to_vec(&conflicting).expect("must encode"),
    )
    .expect("must write settings");

    let (settings, report) = RegistryStore::new(&root).load().expect("must load");
    assert!(settings.package("com.example.a").is_some());
    assert!(settings.package("com.example.b").is_none());
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.contains("app id 10000 already in use")));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn registry_lock_serializes_mutation() {
    let lock = RegistryLock::new(Settings::new());
    let handles = (0..4)
        .map(|index| {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.with(|settings| {
                    settings.acquire_app_id(AppIdOwner::Package(format!("com.example.p{index}")))
                })
            })
        })
        .collect::<Vec<_>>();
    let mut ids = handles
        .into_iter()
        .map(|handle| {
            handle
                .join()
                .expect("thread must finish")
                .expect("must allocate")
        })
        .collect::<Vec<_>>();
    ids.sort_unstable();
    assert_eq!(
        ids,
        (FIRST_APPLICATION_UID..FIRST_APPLICATION_UID + 4).collect::<Vec<_>>()
    );
    assert_eq!(lock.snapshot().users(), vec![SYSTEM_USER]);
}

fn entry(name: &str, app_id: AppId) -> RegistryEntry {
    let mut entry = RegistryEntry::new(name, app_id, format!("/data/app/{name}-1"));
    entry.version_code = 1;
    entry.target_sdk = 30;
    entry
}

fn declaration(name: &str) -> PermissionDeclaration {
    PermissionDeclaration {
        name: name.to_string(),
        protection: ProtectionLevel::Normal,
        protection_flags: Vec::new(),
        group: None,
        gids: Vec::new(),
    }
}

fn test_registry_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_REGISTRY_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "pkgmgr-registry-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}
