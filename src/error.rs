use snafu::Snafu;

pub type Result<T> = core::result::Result<T, PeloadError>;

/// Status returned by every fallible operation in the crate.
///
/// Loader entry points additionally record a finer-grained
/// [`ImageError`] classification on the [`ImageContext`](crate::ImageContext)
/// they were invoked on; that classification is diagnostic only and never
/// replaces the returned status.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum PeloadError {
    /// A reader ran out of bytes.
    #[snafu(display("attempted to read {attempted_read} bytes but there was not enough data"))]
    NotEnoughData { attempted_read: usize },
    /// A writer ran out of space.
    #[snafu(display("attempted to write {attempted_write} bytes but there was not enough space"))]
    NotEnoughSpace { attempted_write: usize },
    /// The image source failed to produce the requested bytes.
    #[snafu(display("image read of {size} bytes at offset {offset} failed"))]
    ImageRead { offset: u64, size: usize },
    /// Not a PE/COFF or TE image, or a machine, subsystem, or relocation
    /// type outside the supported set.
    #[snafu(display("unsupported image: {message}"))]
    Unsupported { message: &'static str },
    /// A caller-supplied address or size violated the documented
    /// preconditions of the operation.
    #[snafu(display("invalid parameter: {message}"))]
    InvalidParameter { message: &'static str },
    /// The image cannot be loaded as laid out on disk.
    #[snafu(display("load error: {message}"))]
    LoadError { message: &'static str },
    /// The destination buffer is smaller than the image requires.
    #[snafu(display("buffer too small: image needs {needed} bytes, {provided} provided"))]
    BufferTooSmall { needed: u64, provided: u64 },
}

impl PeloadError {
    #[cold]
    pub const fn not_enough_data(size: usize) -> Self {
        Self::NotEnoughData {
            attempted_read: size,
        }
    }

    #[cold]
    pub const fn not_enough_space(size: usize) -> Self {
        Self::NotEnoughSpace {
            attempted_write: size,
        }
    }

    #[cold]
    pub const fn image_read(offset: u64, size: usize) -> Self {
        Self::ImageRead { offset, size }
    }

    #[cold]
    pub const fn unsupported(message: &'static str) -> Self {
        Self::Unsupported { message }
    }

    #[cold]
    pub const fn invalid_parameter(message: &'static str) -> Self {
        Self::InvalidParameter { message }
    }

    #[cold]
    pub const fn load_error(message: &'static str) -> Self {
        Self::LoadError { message }
    }

    #[cold]
    pub const fn buffer_too_small(needed: u64, provided: u64) -> Self {
        Self::BufferTooSmall { needed, provided }
    }
}

/// Classification of the last failure, stored on the
/// [`ImageContext`](crate::ImageContext).
///
/// More specific than the returned [`PeloadError`]; a caller that only
/// needs pass/fail can ignore it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    #[default]
    Success,
    /// The image source failed.
    ImageRead,
    /// A translated address fell outside the loaded image.
    InvalidImageAddress,
    /// The destination buffer does not satisfy the computed image size.
    InvalidImageSize,
    /// A relocation-stripped image declared the runtime-driver subsystem.
    InvalidSubsystem,
    /// The destination buffer is not aligned to the section alignment.
    InvalidSectionAlignment,
    /// A section resolved outside the destination buffer.
    SectionNotLoaded,
    /// A relocation block or fixup site fell outside the loaded image,
    /// or a relocation type could not be applied.
    FailedRelocation,
}
