// Serial console output

use core::fmt;

/// Serial print macros; the log backend and the panic path both land here.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    use fmt::Write;

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::instructions::interrupts;

        interrupts::without_interrupts(|| {
            // SAFETY: COM1 at the standard ISA port; exclusive by the
            // interrupt guard.
            let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
            let _ = port.write_fmt(args);
        });
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        struct HostConsole;
        impl fmt::Write for HostConsole {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                std::eprint!("{}", s);
                Ok(())
            }
        }
        let _ = HostConsole.write_fmt(args);
    }
}
