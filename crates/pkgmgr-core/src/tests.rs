use super::*;

#[test]
fn parse_descriptor() {
    let content = r#"
name = "com.example.notes"
version_code = 42
version_name = "4.2"
original_names = ["com.example.oldnotes"]
min_sdk = 21
target_sdk = 30
install_location = "prefer-external"
requested_permissions = ["android.permission.CAMERA", "com.example.notes.SYNC"]
native_abis = ["arm64-v8a", "x86_64"]
upgrade_key_sets = ["release"]

[flags]
has_code = true
debuggable = true

[[permissions]]
name = "com.example.notes.SYNC"
protection = "signature"
protection_flags = ["privileged", "development"]
gids = [3003]

[[components]]
kind = "activity"
name = ".MainActivity"
exported = true
web_hosts = ["notes.example.com", "*.example.org"]
auto_verify = true

[[components]]
kind = "provider"
name = ".NotesProvider"
authorities = ["com.example.notes.data"]

[[key_sets]]
name = "release"
public_keys = ["ABCDEF"]
"#;

    let parsed = PackageDescriptor::from_toml_str(content).expect("descriptor should parse");
    assert_eq!(parsed.name, "com.example.notes");
    assert_eq!(parsed.version_code, 42);
    assert_eq!(parsed.version_name.as_deref(), Some("4.2"));
    assert_eq!(parsed.original_names, vec!["com.example.oldnotes"]);
    assert_eq!(
        parsed.install_location,
        InstallLocationPreference::PreferExternal
    );
    assert!(parsed.uses_runtime_permissions());
    assert!(parsed.flags.has_code);
    assert!(parsed.flags.debuggable);
    assert!(!parsed.flags.test_only);
    assert_eq!(parsed.provider_authorities(), vec!["com.example.notes.data"]);
    assert_eq!(
        parsed.hosts_to_verify().into_iter().collect::<Vec<_>>(),
        vec!["*.example.org".to_string(), "notes.example.com".to_string()]
    );
    let permission = parsed
        .declared_permission("com.example.notes.SYNC")
        .expect("must declare sync permission");
    assert_eq!(permission.protection, ProtectionLevel::Signature);
    assert!(permission.has_flag(ProtectionFlag::Development));
    assert!(!permission.has_flag(ProtectionFlag::Installer));
    assert!(parsed.certificates.is_empty());
    assert_eq!(parsed.attributes, InstallerAttributes::default());
}

#[test]
fn parse_descriptor_defaults_to_runtime_permission_model() {
    let parsed = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.min"
version_code = 1
"#,
    )
    .expect("minimal descriptor should parse");
    assert_eq!(parsed.target_sdk, RUNTIME_PERMISSIONS_TARGET_SDK);
    assert!(parsed.uses_runtime_permissions());
    assert_eq!(parsed.install_location, InstallLocationPreference::Auto);
    assert_eq!(parsed.unit_names(), vec!["com.example.min"]);
}

#[test]
fn parse_descriptor_rejects_bad_package_name() {
    for name in ["notes", "com..example", "com.1example", "com.exa mple"] {
        let content = format!("name = \"{name}\"\nversion_code = 1\n");
        let err = PackageDescriptor::from_toml_str(&content)
            .expect_err("invalid package name must fail");
        assert_eq!(
            err.outcome,
            InstallOutcome::ParseFailedBadPackageName,
            "unexpected outcome for {name}: {err}"
        );
    }
}

#[test]
fn parse_descriptor_rejects_bad_shared_user_id() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.a"
version_code = 1
shared_user_id = "shared"
"#,
    )
    .expect_err("shared identity without separator must fail");
    assert_eq!(err.outcome, InstallOutcome::ParseFailedBadSharedUserId);
}

#[test]
fn parse_descriptor_rejects_malformed_toml() {
    let err = PackageDescriptor::from_toml_str("name = \"com.example.a\"\nversion_code = \"one\"\n")
        .expect_err("wrong field type must fail");
    assert_eq!(err.outcome, InstallOutcome::ParseFailedManifestMalformed);
    assert_eq!(err.category(), ErrorCategory::Parse);
}

#[test]
fn parse_descriptor_rejects_authorities_on_non_provider() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.a"
version_code = 1

[[components]]
kind = "service"
name = ".Sync"
authorities = ["com.example.a.sync"]
"#,
    )
    .expect_err("service authorities must fail");
    assert!(
        err.message.contains("only providers may declare authorities"),
        "unexpected error: {err}"
    );
}

#[test]
fn parse_descriptor_rejects_invalid_web_host() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.a"
version_code = 1

[[components]]
kind = "activity"
name = ".Main"
web_hosts = ["exa_mple.com"]
auto_verify = true
"#,
    )
    .expect_err("invalid host must fail");
    assert!(err.message.contains("invalid web host"), "unexpected error: {err}");
}

#[test]
fn parse_descriptor_rejects_undeclared_upgrade_key_set() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.a"
version_code = 1
upgrade_key_sets = ["release"]
"#,
    )
    .expect_err("undeclared upgrade key set must fail");
    assert!(err.message.contains("upgrade key set 'release'"));
}

#[test]
fn parse_descriptor_rejects_duplicate_permission_definition() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.a"
version_code = 1

[[permissions]]
name = "com.example.a.READ"
protection = "normal"

[[permissions]]
name = "com.example.a.READ"
protection = "dangerous"
"#,
    )
    .expect_err("duplicate permission must fail");
    assert!(err.message.contains("declared twice"));
}

#[test]
fn parse_descriptor_with_child_packages() {
    let mut parsed = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.suite"
version_code = 7
shared_user_id = "com.example.shared"

[[child_packages]]
name = "com.example.suite.mail"
version_code = 7

[[child_packages]]
name = "com.example.suite.calendar"
version_code = 7
"#,
    )
    .expect("parent with children should parse");
    assert!(parsed.has_children());
    assert_eq!(
        parsed.unit_names(),
        vec![
            "com.example.suite",
            "com.example.suite.mail",
            "com.example.suite.calendar"
        ]
    );

    parsed.certificates = CertificateSet::new(["AA11"]);
    parsed.attributes.system = true;
    parsed.code_path = std::path::PathBuf::from("/data/app/com.example.suite-1");
    parsed.propagate_to_children();
    for child in &parsed.child_packages {
        assert!(child.certificates.contains("aa11"));
        assert!(child.attributes.system);
        assert_eq!(child.code_path, parsed.code_path);
        assert_eq!(child.shared_user_id.as_deref(), Some("com.example.shared"));
    }
}

#[test]
fn parse_descriptor_rejects_nested_child_packages() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.suite"
version_code = 1

[[child_packages]]
name = "com.example.suite.mail"
version_code = 1

[[child_packages.child_packages]]
name = "com.example.suite.mail.inner"
version_code = 1
"#,
    )
    .expect_err("grandchildren must fail");
    assert!(err.message.contains("must not declare sub-packages"));
}

#[test]
fn parse_descriptor_rejects_child_with_foreign_shared_identity() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.suite"
version_code = 1

[[child_packages]]
name = "com.example.suite.mail"
version_code = 1
shared_user_id = "com.example.other"
"#,
    )
    .expect_err("child with different shared identity must fail");
    assert_eq!(err.outcome, InstallOutcome::ParseFailedBadSharedUserId);
}

#[test]
fn parse_descriptor_rejects_child_named_like_parent() {
    let err = PackageDescriptor::from_toml_str(
        r#"
name = "com.example.suite"
version_code = 1

[[child_packages]]
name = "com.example.suite"
version_code = 1
"#,
    )
    .expect_err("child reusing the parent name must fail");
    assert!(err.message.contains("not unique"));
}

#[test]
fn install_outcome_codes_are_stable() {
    assert_eq!(InstallOutcome::Succeeded.code(), 1);
    assert_eq!(InstallOutcome::UpdateIncompatible.code(), -7);
    assert_eq!(InstallOutcome::VersionDowngrade.code(), -25);
    assert_eq!(InstallOutcome::InternalError.code(), -110);
    assert_eq!(
        InstallOutcome::from_code(-22),
        Some(InstallOutcome::VerificationFailure)
    );
    assert_eq!(
        InstallOutcome::parse("install_failed_conflicting_provider"),
        Some(InstallOutcome::ConflictingProvider)
    );
    assert_eq!(InstallOutcome::from_code(-9), None);
    assert_eq!(
        InstallOutcome::DuplicatePackage.to_string(),
        "INSTALL_FAILED_DUPLICATE_PACKAGE (-5)"
    );
}

#[test]
fn outcome_codes_are_unique_per_enumeration() {
    let mut install = InstallOutcome::ALL
        .iter()
        .map(|outcome| outcome.code())
        .collect::<Vec<_>>();
    install.sort_unstable();
    install.dedup();
    assert_eq!(install.len(), InstallOutcome::ALL.len());

    assert_eq!(MoveOutcome::Succeeded.code(), -100);
    assert!(MoveOutcome::Succeeded.is_success());
    assert!(!UninstallOutcome::OwnerBlocked.is_success());
    assert!(VerificationDecision::AllowWithoutSufficient.allows());
    assert!(!VerificationDecision::Reject.allows());
}

#[test]
fn error_categories_follow_outcomes() {
    let parse = PackageManagerError::new(InstallOutcome::ParseFailedNoCertificates, "x");
    assert_eq!(parse.category(), ErrorCategory::Parse);
    let resource = PackageManagerError::new(InstallOutcome::InsufficientStorage, "x");
    assert_eq!(resource.category(), ErrorCategory::Resource);
    let verification = PackageManagerError::new(InstallOutcome::VerificationTimeout, "x");
    assert_eq!(verification.category(), ErrorCategory::Verification);
    let policy = PackageManagerError::new(InstallOutcome::UpdateIncompatible, "x");
    assert_eq!(policy.category(), ErrorCategory::Policy);
    assert_eq!(
        PackageManagerError::internal("boom").category(),
        ErrorCategory::Invariant
    );

    let chained = anyhow::anyhow!("disk full").context("failed to copy archive");
    let wrapped = PackageManagerError::from_anyhow(InstallOutcome::InsufficientStorage, &chained);
    assert_eq!(wrapped.message, "failed to copy archive: disk full");
}

#[test]
fn permission_flags_apply_masked_values() {
    let mut flags = PermissionFlags::USER_SET | PermissionFlags::REVOKE_ON_UPGRADE;
    assert!(flags.contains(PermissionFlags::USER_SET));
    assert!(flags.intersects(PermissionFlags::USER_CHANGES));

    flags.apply(
        PermissionFlags::USER_CHANGES,
        PermissionFlags::USER_FIXED,
    );
    assert!(!flags.contains(PermissionFlags::USER_SET));
    assert!(flags.contains(PermissionFlags::USER_FIXED));
    assert!(flags.contains(PermissionFlags::REVOKE_ON_UPGRADE));

    flags.remove(PermissionFlags::REVOKE_ON_UPGRADE);
    assert_eq!(flags.describe(), vec!["user-fixed"]);
    assert_eq!(PermissionFlags::from_bits(u32::MAX), PermissionFlags::ALL);
}

#[test]
fn install_flags_reject_conflicting_locations() {
    let both = InstallFlags {
        internal: true,
        external: true,
        ..InstallFlags::default()
    };
    assert_eq!(
        both.validate().expect_err("must reject").outcome,
        InstallOutcome::InvalidInstallLocation
    );

    let ephemeral_external = InstallFlags {
        ephemeral: true,
        external: true,
        ..InstallFlags::default()
    };
    assert!(ephemeral_external.validate().is_err());

    let locked_volume = InstallFlags {
        forward_locked: true,
        external: true,
        volume_uuid: Some("abcd-1234".to_string()),
        ..InstallFlags::default()
    };
    locked_volume
        .validate()
        .expect("forward lock on an explicit volume is allowed");
}

#[test]
fn certificate_sets_normalize_keys() {
    let set = CertificateSet::new(["ABCD", " ef01 ", ""]);
    assert_eq!(set.len(), 2);
    assert!(set.contains("abcd"));
    assert!(set.contains("EF01"));
    assert!(set.contains_all(["abcd", "ef01"]));
    assert!(!set.contains_all(["abcd", "9999"]));
}

#[test]
fn user_target_parses_tokens() {
    assert_eq!(UserTarget::parse("all"), Some(UserTarget::All));
    assert_eq!(UserTarget::parse(" 10 "), Some(UserTarget::User(10)));
    assert_eq!(UserTarget::parse("owner"), None);
    assert!(UserTarget::All.includes(SYSTEM_USER));
    assert!(!UserTarget::User(10).includes(SYSTEM_USER));
    assert_eq!(UserTarget::User(10).to_string(), "10");
}

#[test]
fn origin_describes_its_source() {
    let origin = Origin::Staged(std::path::PathBuf::from("/tmp/session-1"));
    assert!(origin.is_staged());
    assert_eq!(origin.describe(), "staged:/tmp/session-1");
    assert!(!Origin::Container("cid".to_string()).is_staged());
    assert!(EnabledState::Default.is_enabled());
    assert!(!EnabledState::DisabledUser.is_enabled());
}
