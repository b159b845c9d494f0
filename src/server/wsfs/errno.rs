//! Host errno to protocol status mapping.

use std::io;

use crate::protocol::ErrorCode;

/// Maps a host I/O error to the wire status reported to the client.
/// Errors without a portable equivalent collapse to
/// [`ErrorCode::Unknown`].
pub fn error_code(err: &io::Error) -> ErrorCode {
    let Some(errno) = err.raw_os_error() else {
        return ErrorCode::Unknown;
    };
    match errno {
        libc::EACCES | libc::EROFS | libc::EPERM | libc::EFAULT => ErrorCode::Access,
        libc::EBUSY => ErrorCode::Busy,
        libc::EEXIST => ErrorCode::Exists,
        libc::ENAMETOOLONG => ErrorCode::TooLong,
        libc::EINVAL => ErrorCode::Invalid,
        libc::EBADF => ErrorCode::InvalidFd,
        libc::ENOENT => ErrorCode::NotExists,
        libc::ELOOP => ErrorCode::Loop,
        libc::EDQUOT | libc::ENOSPC => ErrorCode::NoSpace,
        libc::ENOTEMPTY => ErrorCode::NotEmpty,
        libc::ENOTDIR => ErrorCode::Type,
        libc::EIO => ErrorCode::Io,
        libc::ENOTSUP => ErrorCode::NotSupport,
        _ => ErrorCode::Unknown,
    }
}

/// Retries an interruptible syscall while it reports `EINTR`.
pub fn retry_eintr<T>(mut call: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match call() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_err(errno: i32) -> io::Error {
        io::Error::from_raw_os_error(errno)
    }

    #[test]
    fn maps_common_errnos() {
        assert_eq!(error_code(&os_err(libc::EACCES)), ErrorCode::Access);
        assert_eq!(error_code(&os_err(libc::EROFS)), ErrorCode::Access);
        assert_eq!(error_code(&os_err(libc::EPERM)), ErrorCode::Access);
        assert_eq!(error_code(&os_err(libc::EEXIST)), ErrorCode::Exists);
        assert_eq!(error_code(&os_err(libc::ENOENT)), ErrorCode::NotExists);
        assert_eq!(error_code(&os_err(libc::ENAMETOOLONG)), ErrorCode::TooLong);
        assert_eq!(error_code(&os_err(libc::EINVAL)), ErrorCode::Invalid);
        assert_eq!(error_code(&os_err(libc::EBADF)), ErrorCode::InvalidFd);
        assert_eq!(error_code(&os_err(libc::ELOOP)), ErrorCode::Loop);
        assert_eq!(error_code(&os_err(libc::ENOSPC)), ErrorCode::NoSpace);
        assert_eq!(error_code(&os_err(libc::EDQUOT)), ErrorCode::NoSpace);
        assert_eq!(error_code(&os_err(libc::ENOTEMPTY)), ErrorCode::NotEmpty);
        assert_eq!(error_code(&os_err(libc::ENOTDIR)), ErrorCode::Type);
        assert_eq!(error_code(&os_err(libc::EIO)), ErrorCode::Io);
        assert_eq!(error_code(&os_err(libc::ENOTSUP)), ErrorCode::NotSupport);
        assert_eq!(error_code(&os_err(libc::EBUSY)), ErrorCode::Busy);
    }

    #[test]
    fn unmapped_errors_are_unknown() {
        assert_eq!(error_code(&os_err(libc::EXDEV)), ErrorCode::Unknown);
        assert_eq!(error_code(&io::Error::other("no errno")), ErrorCode::Unknown);
    }

    #[test]
    fn retry_eintr_retries_until_success() {
        let mut attempts = 0;
        let result = retry_eintr(|| {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from_raw_os_error(libc::EINTR))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
