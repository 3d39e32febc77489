pub const FULL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+git.",
    env!("BUYRUK_GIT_COUNT"),
    ".",
    env!("BUYRUK_GIT_SHA"),
    env!("BUYRUK_GIT_DIRTY")
);

pub const SHA: &str = env!("BUYRUK_GIT_SHA");
