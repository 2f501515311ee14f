//! DTR/RTS reset sequences
//!
//! On most development boards DTR and RTS drive GPIO0 and EN through a pair
//! of transistors. Pulsing the two lines in the right order either holds
//! GPIO0 low across a reset, which drops the chip into its serial bootloader,
//! or performs a plain reset into the user application.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{error::Error, transport::Transport};

/// Time the lines are held at each step of a sequence.
const RESET_HOLD_DELAY: Duration = Duration::from_millis(100);

/// Reset the chip into its serial bootloader.
pub fn enter_bootloader(transport: &mut dyn Transport) -> Result<(), Error> {
    debug!("Resetting target into the bootloader");

    transport.set_control_lines(true, false)?;
    sleep(RESET_HOLD_DELAY);
    transport.set_control_lines(false, true)?;
    sleep(RESET_HOLD_DELAY);
    transport.set_control_lines(true, false)?;

    Ok(())
}

/// Reset the chip and let it boot the user application.
pub fn reset_to_run(transport: &mut dyn Transport) -> Result<(), Error> {
    debug!("Resetting target into the user application");

    transport.set_control_lines(false, false)?;
    sleep(RESET_HOLD_DELAY);
    transport.set_control_lines(false, true)?;
    sleep(RESET_HOLD_DELAY);
    transport.set_control_lines(false, false)?;

    Ok(())
}
