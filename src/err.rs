use std::io;
use thiserror::Error;

/// Hook installation / removal errors.
#[derive(Error, Debug)]
pub enum HookError {
    /// install() was called on a hook that is already installed.
    #[error("hook is already installed")]
    AlreadyInstalled,

    /// remove() was called on a hook that is not installed.
    #[error("hook is already removed")]
    AlreadyRemoved,

    /// The target page lacks execute permission.
    #[error("target is not executable")]
    NotExecutable,

    /// The scoped protection change failed.
    #[error("memory protection change failed")]
    ProtectViolation,

    /// A prologue of at least 5 whole-instruction bytes is not reachable,
    /// or the prologue contains an instruction the trampoline refuses to
    /// relocate.
    #[error("not enough patchable space at target")]
    NotEnoughSpace,

    /// The target address is zero.
    #[error("invalid target address")]
    InvalidAddress,

    /// Snapshotting bytes out of the target or codecave failed.
    #[error("creating a byte backup failed")]
    BackupCreating,

    /// Restoring the original prologue bytes failed.
    #[error("restoring a byte backup failed")]
    BackupRestoring,

    /// The executable allocator could not provide a codecave.
    #[error("codecave allocation failed")]
    AllocateCodecave,

    /// Releasing the codecave back to the OS failed.
    #[error("codecave deallocation failed")]
    DeallocateCodecave,

    /// A low-level write under an active protection guard failed.
    #[error("write to target memory failed")]
    WriteMemory,

    /// NOPping out the codecave entry failed during a soft removal.
    #[error("removing the usercode jump failed")]
    UsercodeJumpRemove,

    /// Restoring the saved codecave entry bytes failed on re-install.
    #[error("re-installing from the saved usercode jump failed")]
    ReinstallHook,

    /// Some io error from the code emitter.
    #[error("io error")]
    Io(#[from] io::Error),
}

/// Low-level memory operation errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// The given address is zero.
    #[error("invalid address")]
    InvalidAddress,

    /// A scoped protection change failed.
    #[error("invalid protection change")]
    InvalidProtectChange,

    /// The memory is not readable and no protection change was requested.
    #[error("memory is not readable")]
    UnreadableMemory,

    /// The memory is not writeable and no protection change was requested.
    #[error("memory is not writeable")]
    UnwriteableMemory,

    /// The operation size is zero.
    #[error("size is zero")]
    NullSize,

    /// The destination address is zero.
    #[error("invalid destination address")]
    InvalidDestination,

    /// The source address is zero.
    #[error("invalid source address")]
    InvalidSource,
}
