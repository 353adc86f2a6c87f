use serde::{Deserialize, Serialize};

macro_rules! outcome_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $code:expr, $token:literal;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn code(self) -> i32 {
                match self {
                    $(Self::$variant => $code,)+
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $token,)+
                }
            }

            pub fn from_code(code: i32) -> Option<Self> {
                Self::ALL.iter().copied().find(|outcome| outcome.code() == code)
            }

            pub fn parse(token: &str) -> Option<Self> {
                let token = token.trim();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|outcome| outcome.as_str().eq_ignore_ascii_case(token))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{} ({})", self.as_str(), self.code())
            }
        }
    };
}

outcome_enum! {
    /// Terminal result of an install request. Codes are part of the external
    /// contract and must stay stable.
    pub enum InstallOutcome {
        Succeeded = 1, "INSTALL_SUCCEEDED";
        AlreadyExists = -1, "INSTALL_FAILED_ALREADY_EXISTS";
        InvalidApk = -2, "INSTALL_FAILED_INVALID_APK";
        InvalidUri = -3, "INSTALL_FAILED_INVALID_URI";
        InsufficientStorage = -4, "INSTALL_FAILED_INSUFFICIENT_STORAGE";
        DuplicatePackage = -5, "INSTALL_FAILED_DUPLICATE_PACKAGE";
        NoSharedUser = -6, "INSTALL_FAILED_NO_SHARED_USER";
        UpdateIncompatible = -7, "INSTALL_FAILED_UPDATE_INCOMPATIBLE";
        SharedUserIncompatible = -8, "INSTALL_FAILED_SHARED_USER_INCOMPATIBLE";
        ReplaceCouldntDelete = -10, "INSTALL_FAILED_REPLACE_COULDNT_DELETE";
        Dexopt = -11, "INSTALL_FAILED_DEXOPT";
        OlderSdk = -12, "INSTALL_FAILED_OLDER_SDK";
        ConflictingProvider = -13, "INSTALL_FAILED_CONFLICTING_PROVIDER";
        TestOnly = -15, "INSTALL_FAILED_TEST_ONLY";
        CpuAbiIncompatible = -16, "INSTALL_FAILED_CPU_ABI_INCOMPATIBLE";
        ContainerError = -18, "INSTALL_FAILED_CONTAINER_ERROR";
        InvalidInstallLocation = -19, "INSTALL_FAILED_INVALID_INSTALL_LOCATION";
        MediaUnavailable = -20, "INSTALL_FAILED_MEDIA_UNAVAILABLE";
        VerificationTimeout = -21, "INSTALL_FAILED_VERIFICATION_TIMEOUT";
        VerificationFailure = -22, "INSTALL_FAILED_VERIFICATION_FAILURE";
        PackageChanged = -23, "INSTALL_FAILED_PACKAGE_CHANGED";
        UidChanged = -24, "INSTALL_FAILED_UID_CHANGED";
        VersionDowngrade = -25, "INSTALL_FAILED_VERSION_DOWNGRADE";
        PermissionModelDowngrade = -26, "INSTALL_FAILED_PERMISSION_MODEL_DOWNGRADE";
        ParseFailedNotApk = -100, "INSTALL_PARSE_FAILED_NOT_APK";
        ParseFailedBadManifest = -101, "INSTALL_PARSE_FAILED_BAD_MANIFEST";
        ParseFailedUnexpectedException = -102, "INSTALL_PARSE_FAILED_UNEXPECTED_EXCEPTION";
        ParseFailedNoCertificates = -103, "INSTALL_PARSE_FAILED_NO_CERTIFICATES";
        ParseFailedInconsistentCertificates = -104, "INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES";
        ParseFailedCertificateEncoding = -105, "INSTALL_PARSE_FAILED_CERTIFICATE_ENCODING";
        ParseFailedBadPackageName = -106, "INSTALL_PARSE_FAILED_BAD_PACKAGE_NAME";
        ParseFailedBadSharedUserId = -107, "INSTALL_PARSE_FAILED_BAD_SHARED_USER_ID";
        ParseFailedManifestMalformed = -108, "INSTALL_PARSE_FAILED_MANIFEST_MALFORMED";
        InternalError = -110, "INSTALL_FAILED_INTERNAL_ERROR";
        UserRestricted = -111, "INSTALL_FAILED_USER_RESTRICTED";
        DuplicatePermission = -112, "INSTALL_FAILED_DUPLICATE_PERMISSION";
        NoMatchingAbis = -113, "INSTALL_FAILED_NO_MATCHING_ABIS";
        Aborted = -115, "INSTALL_FAILED_ABORTED";
        EphemeralInvalid = -116, "INSTALL_FAILED_EPHEMERAL_INVALID";
    }
}

outcome_enum! {
    pub enum UninstallOutcome {
        Succeeded = 1, "DELETE_SUCCEEDED";
        InternalError = -1, "DELETE_FAILED_INTERNAL_ERROR";
        DevicePolicyManager = -2, "DELETE_FAILED_DEVICE_POLICY_MANAGER";
        UserRestricted = -3, "DELETE_FAILED_USER_RESTRICTED";
        OwnerBlocked = -4, "DELETE_FAILED_OWNER_BLOCKED";
        Aborted = -5, "DELETE_FAILED_ABORTED";
    }
}

outcome_enum! {
    pub enum MoveOutcome {
        Succeeded = -100, "MOVE_SUCCEEDED";
        InsufficientStorage = -1, "MOVE_FAILED_INSUFFICIENT_STORAGE";
        DoesntExist = -2, "MOVE_FAILED_DOESNT_EXIST";
        SystemPackage = -3, "MOVE_FAILED_SYSTEM_PACKAGE";
        ForwardLocked = -4, "MOVE_FAILED_FORWARD_LOCKED";
        InvalidLocation = -5, "MOVE_FAILED_INVALID_LOCATION";
        InternalError = -6, "MOVE_FAILED_INTERNAL_ERROR";
        OperationPending = -7, "MOVE_FAILED_OPERATION_PENDING";
    }
}

outcome_enum! {
    /// A verifier's vote on a pending install.
    pub enum VerificationDecision {
        Allow = 1, "allow";
        AllowWithoutSufficient = 2, "allow-without-sufficient";
        Reject = -1, "reject";
    }
}

impl InstallOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Succeeded
    }
}

impl UninstallOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Succeeded
    }
}

impl MoveOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Succeeded
    }
}

impl VerificationDecision {
    pub fn allows(self) -> bool {
        !matches!(self, Self::Reject)
    }
}
