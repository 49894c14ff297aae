pub(crate) mod backoff;
pub(crate) mod phaser;
pub(crate) mod recorder;
pub(crate) mod ring;
