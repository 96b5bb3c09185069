//! ALSA PCM device wrappers for the capture and render threads.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters actually negotiated with the hardware; the requested rate
/// is a hint, the device may settle nearby.
#[derive(Debug, Clone, Copy)]
pub struct DeviceParams {
    pub sample_rate: u32,
    pub period_size: usize,
}

/// Open a mono S16LE capture device.
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, DeviceParams)> {
    open_pcm(device, Direction::Capture, sample_rate, "capture")
}

/// Open a mono S16LE playback device.
pub fn open_playback(device: &str, sample_rate: u32) -> Result<(PCM, DeviceParams)> {
    open_pcm(device, Direction::Playback, sample_rate, "playback")
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    dir_name: &str,
) -> Result<(PCM, DeviceParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("opening PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("initializing hardware params")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        DeviceParams {
            sample_rate: hwp.get_rate()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, period={}",
        dir_name,
        device,
        params.sample_rate,
        params.period_size,
    );

    Ok((pcm, params))
}
