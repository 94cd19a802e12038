#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Serial error: {0}")]
    SerialError(#[from] std::io::Error),

    #[error("Termios error: {0}")]
    TermiosError(#[from] nix::Error),
}
