//! Fill Level Indicator Module
//!
//! Shows the tank fill level on the red/green LED: green for full, red for empty, mixed in
//! between. The LED blinks red while there is no valid measurement and blinks the level color
//! while the access point is up.
use crate::system::indicator;
use crate::system::resources::RGBLedResources;
use crate::system::state::{CALIBRATION, MEASUREMENT, SYSTEM_STATE};
use defmt::debug;
use embassy_futures::select::select;
use embassy_futures::select::Either;
use embassy_rp::pwm;
use embassy_rp::pwm::SetDutyCycle;
use embassy_time::{Duration, Timer};

/// Interval for LED blinking
const BLINK_INTERVAL: Duration = Duration::from_millis(700);

/// Interval for LED blinking when affirming state change
const AFFIRM_BLINK_INTERVAL: Duration = Duration::from_millis(30);

/// Controls the LED indicator from the latest measurement
#[embassy_executor::task]
pub async fn level_indicate(r: RGBLedResources) {
    // configure pwm for the led, 100Hz
    let desired_freq_hz = 100;
    let clock_freq_hz = embassy_rp::clocks::clk_sys_freq(); // 150MHz

    // Calculate minimum divider needed to keep period under 16-bit limit (65535)
    let divider = ((clock_freq_hz / desired_freq_hz) / 65535 + 1) as u8;
    let period = (clock_freq_hz / (desired_freq_hz * divider as u32)) as u16 - 1;

    let mut config = pwm::Config::default();
    config.divider = divider.into();
    config.top = period;
    let mut pwm_red = pwm::Pwm::new_output_a(r.pwm_red, r.red_pin, config.clone());
    let mut pwm_green = pwm::Pwm::new_output_a(r.pwm_green, r.green_pin, config);

    let mut led_on = false;
    let _ = pwm_red.set_duty_cycle_fully_off();
    let _ = pwm_green.set_duty_cycle_fully_off();

    loop {
        let affirm = indicator::wait().await;

        // affirm a change in the indicator by blinking the LED
        if affirm {
            for _ in 0..5 {
                if led_on {
                    let _ = pwm_red.set_duty_cycle_fully_off();
                    let _ = pwm_green.set_duty_cycle_fully_on();
                } else {
                    let _ = pwm_red.set_duty_cycle_fully_on();
                    let _ = pwm_green.set_duty_cycle_fully_off();
                }
                led_on = !led_on;
                Timer::after(AFFIRM_BLINK_INTERVAL).await;
            }
            led_on = false;
        }

        let fill = CALIBRATION.get().levels().fill_percent(MEASUREMENT.snapshot().measured_cm);
        let access_point_active = SYSTEM_STATE.lock().await.access_point_active;
        debug!("fill level {:?}%", fill);

        let (red_pwm, green_pwm, blink) = match fill {
            Some(percent) => (100 - percent, percent, access_point_active),
            None => (100, 0, true),
        };

        if !blink {
            let _ = pwm_red.set_duty_cycle_percent(red_pwm);
            let _ = pwm_green.set_duty_cycle_percent(green_pwm);
            continue;
        }

        'blink: loop {
            if led_on {
                let _ = pwm_red.set_duty_cycle_percent(red_pwm);
                let _ = pwm_green.set_duty_cycle_percent(green_pwm);
            } else {
                let _ = pwm_red.set_duty_cycle_fully_off();
                let _ = pwm_green.set_duty_cycle_fully_off();
            }

            led_on = !led_on;

            // Wait for either the blink interval to pass or a refresh request
            if let Either::Second(affirm) = select(Timer::after(BLINK_INTERVAL), indicator::wait()).await {
                indicator::update(affirm);
                break 'blink;
            }
        }
    }
}
