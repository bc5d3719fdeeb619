//! Hardware Resource Management
//!
//! Splits the RP2350 peripherals into groups, one per task, so that every pin and peripheral
//! has exactly one owner.
//!
//! # Resource Groups
//! - Distance Sensor: HC-SR04 style ultrasonic transducer pins
//! - RGB LED: PWM-controlled fill level indicator
//! - Modem: UART to the network co-processor
//! - Access Point: status line of the network co-processor
//! - Bridge: UART carrying requests from the web front end
//! - Settings: on-chip flash holding the settings store
//! - Power: watchdog, used for the timed deep sleep

use assign_resources::assign_resources;
use embassy_rp::bind_interrupts;
use embassy_rp::peripherals::{self, UART0, UART1};
use embassy_rp::uart::InterruptHandler as UartInterruptHandler;

assign_resources! {
    /// Ultrasonic distance sensor pins
    distance_sensor: DistanceSensorResources {
       trigger_pin: PIN_15,
       echo_pin: PIN_14,
    },
    /// PWM-controlled RGB LED indicator pins
    rgb_led: RGBLedResources {
        pwm_red: PWM_SLICE1,
        pwm_green: PWM_SLICE2,
        red_pin: PIN_2,
        green_pin: PIN_4,
    },
    /// Network co-processor link
    modem: ModemResources {
        uart: UART0,
        tx_pin: PIN_0,
        rx_pin: PIN_1,
        tx_dma: DMA_CH0,
        rx_dma: DMA_CH1,
    },
    /// High while the co-processor serves its own access point
    access_point: AccessPointResources {
        status_pin: PIN_6,
    },
    /// Request bridge from the web front end
    bridge: BridgeResources {
        uart: UART1,
        tx_pin: PIN_8,
        rx_pin: PIN_9,
        tx_dma: DMA_CH2,
        rx_dma: DMA_CH3,
    },
    /// On-chip flash for the settings store
    settings: SettingsResources {
        flash: FLASH,
        dma: DMA_CH4,
    },
    /// Watchdog driving the timed deep sleep
    power: PowerResources {
        watchdog: WATCHDOG,
    },
}

bind_interrupts!(pub struct Irqs {
    UART0_IRQ => UartInterruptHandler<UART0>;
    UART1_IRQ => UartInterruptHandler<UART1>;
});
