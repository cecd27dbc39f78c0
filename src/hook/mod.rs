pub mod patch;
pub mod stubs;

/// Class receiving all redirected identity calls.
pub const HOOK_CLASS: &str = "Lcom/clone/hook/Hooks;";

/// Class carrying the spoofed identity payload as static fields.
pub const CONFIG_CLASS: &str = "Lcom/clone/hook/HookConfig;";

/// Broadcast receiver registered by the clone for identity refresh intents.
pub const RECEIVER_CLASS: &str = "Lcom/clone/hook/IdentityReceiver;";
