// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use tracing::{Level, event};

use crate::drivers::Native;
use crate::pal::RawSource;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, OptionId, OptionValue, Result, Stream, StreamFlags, StreamKind, StreamOps};

/// An input mode of a terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Raw,
    Canonical,
    Echo,
}

/// A terminal device. The mode found at open is restored at close.
pub(crate) struct TerminalDriver {
    terminal: Option<sys::Terminal>,
    color: bool,
}

impl TerminalDriver {
    fn new(terminal: sys::Terminal) -> Self {
        let color = terminal.is_tty() && sys::supports_color();
        Self {
            terminal: Some(terminal),
            color,
        }
    }

    fn terminal(&mut self) -> Result<&mut sys::Terminal> {
        self.terminal.as_mut().ok_or(Error::Code(ErrorCode::BadHandle))
    }
}

impl StreamOps for TerminalDriver {
    fn read(&mut self, buf: &mut [u8], _flags: IoFlags) -> Result<usize> {
        self.terminal()?.read(buf)
    }

    fn write(&mut self, buf: &[u8], _flags: IoFlags) -> Result<usize> {
        self.terminal()?.write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.terminal()?;
        Ok(())
    }

    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        match id {
            OptionId::TERMINAL_RAW => Ok(OptionValue::Bool(self.terminal()?.mode(Mode::Raw)?)),
            OptionId::TERMINAL_CANONICAL => Ok(OptionValue::Bool(self.terminal()?.mode(Mode::Canonical)?)),
            OptionId::TERMINAL_ECHO => Ok(OptionValue::Bool(self.terminal()?.mode(Mode::Echo)?)),
            OptionId::TERMINAL_COLOR => Ok(OptionValue::Bool(self.color)),
            OptionId::TERMINAL_ROWS => Ok(OptionValue::Int(self.terminal()?.window_size()?.0.into())),
            OptionId::TERMINAL_COLUMNS => Ok(OptionValue::Int(self.terminal()?.window_size()?.1.into())),
            OptionId::TERMINAL_IS_TTY => Ok(OptionValue::Bool(self.terminal()?.is_tty())),
            _ => Err(Error::unsupported()),
        }
    }

    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        match id {
            OptionId::TERMINAL_RAW => self.terminal()?.set_mode(Mode::Raw, value.as_bool()?),
            OptionId::TERMINAL_CANONICAL => self.terminal()?.set_mode(Mode::Canonical, value.as_bool()?),
            OptionId::TERMINAL_ECHO => self.terminal()?.set_mode(Mode::Echo, value.as_bool()?),
            OptionId::TERMINAL_COLOR => {
                let color = value.as_bool()?;
                self.terminal()?.set_color(color)?;
                self.color = color;
                Ok(())
            }
            _ => Err(Error::unsupported()),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.terminal.take() {
            Some(terminal) => terminal.close(),
            None => Ok(()),
        }
    }

    fn raw_source(&self) -> Option<RawSource> {
        self.terminal.as_ref().map(sys::Terminal::source)
    }

    fn forget_handle(&mut self) {
        if let Some(terminal) = self.terminal.take() {
            terminal.forget();
        }
    }
}

impl Stream {
    /// Opens the controlling terminal of the process.
    ///
    /// On POSIX this is `/dev/tty`; on Windows the console input and output buffers. The input
    /// mode in effect now is restored when the stream closes.
    ///
    /// # Errors
    ///
    /// Any failure opening the device, typically when the process has no terminal.
    pub fn terminal(flags: StreamFlags) -> Result<Self> {
        let flags = with_default_access(flags, StreamFlags::RDWR);
        let driver = TerminalDriver::new(sys::Terminal::open(flags)?);

        Ok(Self::from_native(StreamKind::Terminal, flags, Native::Terminal(driver)))
    }

    /// Turns a stream over a terminal device into a terminal stream.
    ///
    /// Accepts file and pipe streams, including the standard streams. A handle that is not a
    /// terminal is accepted too; [`OptionId::TERMINAL_IS_TTY`] then reports `false` and the mode
    /// options fail. The returned stream keeps the flags and auto-close setting of `stream`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for kinds that carry no terminal handle,
    /// [`ErrorCode::Busy`] if `stream` is registered with a context.
    pub fn terminal_from(mut stream: Self) -> Result<Self> {
        if stream.kind() == StreamKind::Terminal {
            return Ok(stream);
        }
        if !matches!(stream.kind(), StreamKind::File | StreamKind::Pipe) {
            return Err(Error::invalid_argument());
        }

        let autoclose = stream.get_option(OptionId::AUTOCLOSE)?.as_bool()?;
        let flags = stream.flags();
        let terminal = match stream.take_native()? {
            Native::File(mut file) => sys::Terminal::adopt_file(file.take_file().ok_or(Error::Code(ErrorCode::BadHandle))?)?,
            Native::Pipe(mut pipe) => sys::Terminal::adopt_pipe(&mut pipe)?,
            _ => return Err(Error::invalid_argument()),
        };

        let mut adopted = Self::from_native(StreamKind::Terminal, flags, Native::Terminal(TerminalDriver::new(terminal)));
        adopted.set_option(OptionId::AUTOCLOSE, autoclose)?;
        event!(Level::DEBUG, message = "adopted terminal", from = %stream.id(), id = %adopted.id());
        Ok(adopted)
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd};
    use std::os::unix::fs::OpenOptionsExt;

    use super::Mode;
    use crate::drivers::PipeDriver;
    use crate::pal::RawSource;
    use crate::pal::unix::{check, read, write_no_sigpipe};
    use crate::{Error, ErrorCode, Result, StreamFlags};

    pub(super) struct Terminal {
        fd: OwnedFd,
        saved: Option<libc::termios>,
    }

    impl Terminal {
        pub(super) fn open(flags: StreamFlags) -> Result<Self> {
            let file = OpenOptions::new()
                .read(flags.readable())
                .write(flags.writable())
                .custom_flags(libc::O_NOCTTY | if flags.nonblocking() { libc::O_NONBLOCK } else { 0 })
                .open("/dev/tty")?;

            Ok(Self::adopt(file.into()))
        }

        pub(super) fn adopt_file(file: File) -> Result<Self> {
            Ok(Self::adopt(file.into()))
        }

        pub(super) fn adopt_pipe(pipe: &mut PipeDriver) -> Result<Self> {
            let fd = pipe.take_fd().ok_or(Error::Code(ErrorCode::BadHandle))?;
            Ok(Self::adopt(fd))
        }

        fn adopt(fd: OwnedFd) -> Self {
            let saved = attributes(&fd).ok();
            Self { fd, saved }
        }

        pub(super) fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            Ok(read(self.fd.as_fd(), buf)?)
        }

        pub(super) fn write(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(write_no_sigpipe(self.fd.as_fd(), buf)?)
        }

        pub(super) fn is_tty(&self) -> bool {
            // SAFETY: No pointers are involved.
            unsafe { libc::isatty(self.fd.as_raw_fd()) == 1 }
        }

        pub(super) fn mode(&self, mode: Mode) -> Result<bool> {
            let attrs = attributes(&self.fd)?;

            Ok(match mode {
                Mode::Raw => attrs.c_lflag & (libc::ICANON | libc::ISIG | libc::ECHO) == 0,
                Mode::Canonical => attrs.c_lflag & libc::ICANON != 0,
                Mode::Echo => attrs.c_lflag & libc::ECHO != 0,
            })
        }

        pub(super) fn set_mode(&mut self, mode: Mode, enabled: bool) -> Result<()> {
            let mut attrs = attributes(&self.fd)?;

            match (mode, enabled) {
                // SAFETY: `attrs` is an initialized structure valid for writes.
                (Mode::Raw, true) => unsafe { libc::cfmakeraw(&raw mut attrs) },
                (Mode::Raw, false) => {
                    attrs = self.saved.unwrap_or(attrs);
                    attrs.c_lflag |= libc::ICANON | libc::ISIG | libc::ECHO;
                    attrs.c_iflag |= libc::ICRNL;
                    attrs.c_oflag |= libc::OPOST;
                }
                (Mode::Canonical, enabled) => toggle(&mut attrs.c_lflag, libc::ICANON, enabled),
                (Mode::Echo, enabled) => toggle(&mut attrs.c_lflag, libc::ECHO, enabled),
            }

            set_attributes(&self.fd, &attrs)
        }

        /// Escape sequences are interpreted by the terminal itself.
        pub(super) fn set_color(&mut self, _color: bool) -> Result<()> {
            Ok(())
        }

        pub(super) fn window_size(&self) -> Result<(u16, u16)> {
            // SAFETY: `winsize` is a plain C structure for which all-zero bytes are valid.
            let mut size: libc::winsize = unsafe { std::mem::zeroed() };
            // SAFETY: `size` is valid for writes for the duration of the call.
            check(unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCGWINSZ, &raw mut size) })?;
            Ok((size.ws_row, size.ws_col))
        }

        pub(super) fn close(self) -> Result<()> {
            let restored = match &self.saved {
                Some(saved) => set_attributes(&self.fd, saved),
                None => Ok(()),
            };

            // SAFETY: The descriptor was released from its owner and is closed exactly once.
            check(unsafe { libc::close(self.fd.into_raw_fd()) })?;
            restored
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Fd(self.fd.as_raw_fd())
        }

        pub(super) fn forget(self) {
            let _fd = self.fd.into_raw_fd();
        }
    }

    fn toggle(bits: &mut libc::tcflag_t, flag: libc::tcflag_t, enabled: bool) {
        if enabled {
            *bits |= flag;
        } else {
            *bits &= !flag;
        }
    }

    fn attributes(fd: &OwnedFd) -> Result<libc::termios> {
        // SAFETY: `termios` is a plain C structure for which all-zero bytes are valid.
        let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: `attrs` is valid for writes for the duration of the call.
        check(unsafe { libc::tcgetattr(fd.as_raw_fd(), &raw mut attrs) })?;
        Ok(attrs)
    }

    fn set_attributes(fd: &OwnedFd, attrs: &libc::termios) -> Result<()> {
        // SAFETY: `attrs` is an initialized structure valid for reads.
        check(unsafe { libc::tcsetattr(fd.as_raw_fd(), libc::TCSANOW, attrs) })?;
        Ok(())
    }

    pub(super) fn supports_color() -> bool {
        std::env::var_os("TERM").is_some_and(|term| term != "dumb")
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Write};
    use std::os::windows::io::{AsRawHandle, IntoRawHandle};

    use windows_sys::Win32::System::Console::{
        CONSOLE_MODE, CONSOLE_SCREEN_BUFFER_INFO, ENABLE_ECHO_INPUT, ENABLE_LINE_INPUT, ENABLE_PROCESSED_INPUT,
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetConsoleScreenBufferInfo, SetConsoleMode,
    };

    use super::Mode;
    use crate::drivers::PipeDriver;
    use crate::pal::RawSource;
    use crate::pal::windows::check_bool;
    use crate::{Error, ErrorCode, Result, StreamFlags};

    pub(super) struct Terminal {
        input: File,
        output: File,
        saved: Option<CONSOLE_MODE>,
    }

    impl Terminal {
        pub(super) fn open(_flags: StreamFlags) -> Result<Self> {
            let input = OpenOptions::new().read(true).write(true).open("CONIN$")?;
            let output = OpenOptions::new().read(true).write(true).open("CONOUT$")?;
            Ok(Self::adopt(input, output))
        }

        pub(super) fn adopt_file(file: File) -> Result<Self> {
            let output = file.try_clone()?;
            Ok(Self::adopt(file, output))
        }

        pub(super) fn adopt_pipe(pipe: &mut PipeDriver) -> Result<Self> {
            let file = File::from(pipe.take_handle().ok_or(Error::Code(ErrorCode::BadHandle))?);
            Self::adopt_file(file)
        }

        fn adopt(input: File, output: File) -> Self {
            let saved = console_mode(&input).ok();
            Self { input, output, saved }
        }

        pub(super) fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            Ok(self.input.read(buf)?)
        }

        pub(super) fn write(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(self.output.write(buf)?)
        }

        pub(super) fn is_tty(&self) -> bool {
            console_mode(&self.input).is_ok()
        }

        pub(super) fn mode(&self, mode: Mode) -> Result<bool> {
            let bits = console_mode(&self.input)?;

            Ok(match mode {
                Mode::Raw => bits & (ENABLE_LINE_INPUT | ENABLE_ECHO_INPUT | ENABLE_PROCESSED_INPUT) == 0,
                Mode::Canonical => bits & ENABLE_LINE_INPUT != 0,
                Mode::Echo => bits & ENABLE_ECHO_INPUT != 0,
            })
        }

        pub(super) fn set_mode(&mut self, mode: Mode, enabled: bool) -> Result<()> {
            let bits = console_mode(&self.input)?;
            let flag = match mode {
                Mode::Raw => ENABLE_LINE_INPUT | ENABLE_ECHO_INPUT | ENABLE_PROCESSED_INPUT,
                Mode::Canonical => ENABLE_LINE_INPUT,
                // Echo requires line input on Windows.
                Mode::Echo if enabled => ENABLE_ECHO_INPUT | ENABLE_LINE_INPUT,
                Mode::Echo => ENABLE_ECHO_INPUT,
            };
            // Raw mode clears the flags; the others set them.
            let set = if mode == Mode::Raw { !enabled } else { enabled };

            set_console_mode(&self.input, if set { bits | flag } else { bits & !flag })
        }

        pub(super) fn set_color(&mut self, color: bool) -> Result<()> {
            let bits = console_mode(&self.output)?;
            let bits = if color {
                bits | ENABLE_VIRTUAL_TERMINAL_PROCESSING
            } else {
                bits & !ENABLE_VIRTUAL_TERMINAL_PROCESSING
            };
            set_console_mode(&self.output, bits)
        }

        pub(super) fn window_size(&self) -> Result<(u16, u16)> {
            // SAFETY: `CONSOLE_SCREEN_BUFFER_INFO` is a plain C structure for which all-zero bytes
            // are valid.
            let mut info: CONSOLE_SCREEN_BUFFER_INFO = unsafe { std::mem::zeroed() };
            // SAFETY: `info` is valid for writes for the duration of the call.
            check_bool(unsafe { GetConsoleScreenBufferInfo(self.output.as_raw_handle(), &raw mut info) })?;

            let rows = info.srWindow.Bottom - info.srWindow.Top + 1;
            let columns = info.srWindow.Right - info.srWindow.Left + 1;
            Ok((rows.try_into().unwrap_or_default(), columns.try_into().unwrap_or_default()))
        }

        pub(super) fn close(self) -> Result<()> {
            match self.saved {
                Some(saved) => set_console_mode(&self.input, saved),
                None => Ok(()),
            }
        }

        pub(super) fn source(&self) -> RawSource {
            RawSource::Handle(self.input.as_raw_handle() as isize)
        }

        pub(super) fn forget(self) {
            let _input = self.input.into_raw_handle();
            let _output = self.output.into_raw_handle();
        }
    }

    fn console_mode(file: &File) -> Result<CONSOLE_MODE> {
        let mut mode = 0;
        // SAFETY: `mode` is valid for writes.
        check_bool(unsafe { GetConsoleMode(file.as_raw_handle(), &raw mut mode) })?;
        Ok(mode)
    }

    fn set_console_mode(file: &File, mode: CONSOLE_MODE) -> Result<()> {
        // SAFETY: The handle is owned by the terminal.
        check_bool(unsafe { SetConsoleMode(file.as_raw_handle(), mode) })?;
        Ok(())
    }

    pub(super) fn supports_color() -> bool {
        true
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopting_a_pipe_that_is_not_a_tty() {
        let (reader, mut writer) = Stream::pipe(StreamFlags::empty()).unwrap();
        let mut terminal = Stream::terminal_from(reader).unwrap();

        assert_eq!(terminal.kind(), StreamKind::Terminal);
        assert_eq!(terminal.get_option(OptionId::TERMINAL_IS_TTY).unwrap(), OptionValue::Bool(false));
        assert_eq!(terminal.get_option(OptionId::TERMINAL_COLOR).unwrap(), OptionValue::Bool(false));
        terminal.set_option(OptionId::TERMINAL_RAW, true).unwrap_err();

        writer.write(b"typed").unwrap();
        let mut buf = [0_u8; 8];
        let transfer = terminal.read(&mut buf).unwrap();
        assert_eq!(&buf[..transfer.len()], b"typed");
        terminal.close().unwrap();
    }

    #[test]
    fn kinds_without_a_handle_are_rejected() {
        let memory = Stream::from_memory(vec![0; 4], StreamFlags::RDWR);

        assert_eq!(Stream::terminal_from(memory).unwrap_err().code(), ErrorCode::InvalidArgument);
    }

    #[cfg(target_os = "linux")]
    mod pty {
        use std::ffi::CStr;
        use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

        use super::*;

        /// Opens a pseudo-terminal pair and returns the controller and the path of the device.
        fn open_pty() -> (OwnedFd, std::path::PathBuf) {
            // SAFETY: No pointers are involved.
            let controller = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
            assert!(controller >= 0);
            // SAFETY: `posix_openpt` returned a fresh descriptor.
            let controller = unsafe { OwnedFd::from_raw_fd(controller) };
            // SAFETY: No pointers are involved.
            assert_eq!(unsafe { libc::grantpt(controller.as_raw_fd()) }, 0);
            // SAFETY: No pointers are involved.
            assert_eq!(unsafe { libc::unlockpt(controller.as_raw_fd()) }, 0);

            let mut name: [libc::c_char; 128] = [0; 128];
            // SAFETY: `name` is valid for writes of its length.
            assert_eq!(unsafe { libc::ptsname_r(controller.as_raw_fd(), name.as_mut_ptr(), name.len()) }, 0);
            // SAFETY: `ptsname_r` wrote a NUL-terminated string.
            let path = unsafe { CStr::from_ptr(name.as_ptr()) }.to_str().unwrap().to_owned();

            (controller, path.into())
        }

        #[test]
        fn modes_toggle_and_restore_on_close() {
            let (_controller, path) = open_pty();
            let device = Stream::open_file(&path, StreamFlags::RDWR).unwrap();
            let mut terminal = Stream::terminal_from(device).unwrap();

            assert_eq!(terminal.get_option(OptionId::TERMINAL_IS_TTY).unwrap(), OptionValue::Bool(true));
            assert_eq!(terminal.get_option(OptionId::TERMINAL_CANONICAL).unwrap(), OptionValue::Bool(true));

            terminal.set_option(OptionId::TERMINAL_RAW, true).unwrap();
            assert_eq!(terminal.get_option(OptionId::TERMINAL_RAW).unwrap(), OptionValue::Bool(true));
            assert_eq!(terminal.get_option(OptionId::TERMINAL_ECHO).unwrap(), OptionValue::Bool(false));

            terminal.set_option(OptionId::TERMINAL_RAW, false).unwrap();
            terminal.set_option(OptionId::TERMINAL_ECHO, false).unwrap();
            assert_eq!(terminal.get_option(OptionId::TERMINAL_ECHO).unwrap(), OptionValue::Bool(false));
            terminal.get_option(OptionId::TERMINAL_ROWS).unwrap();
            terminal.close().unwrap();

            let mut check = Stream::terminal_from(Stream::open_file(&path, StreamFlags::RDWR).unwrap()).unwrap();
            assert_eq!(check.get_option(OptionId::TERMINAL_ECHO).unwrap(), OptionValue::Bool(true));
            assert_eq!(check.get_option(OptionId::TERMINAL_CANONICAL).unwrap(), OptionValue::Bool(true));
        }

        #[test]
        fn color_is_a_stored_preference() {
            let (_controller, path) = open_pty();
            let mut terminal = Stream::terminal_from(Stream::open_file(&path, StreamFlags::RDWR).unwrap()).unwrap();

            terminal.set_option(OptionId::TERMINAL_COLOR, false).unwrap();
            assert_eq!(terminal.get_option(OptionId::TERMINAL_COLOR).unwrap(), OptionValue::Bool(false));
            terminal.set_option(OptionId::TERMINAL_COLOR, true).unwrap();
            assert_eq!(terminal.get_option(OptionId::TERMINAL_COLOR).unwrap(), OptionValue::Bool(true));
        }
    }
}
