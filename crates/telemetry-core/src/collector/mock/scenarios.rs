//! Pre-built mock filesystem scenarios for testing.
//!
//! These provide realistic `/sys` and `/proc` states for the metrics the
//! sampler reads.

use super::filesystem::MockFs;

impl MockFs {
    /// A laptop discharging on battery with one wireless interface.
    ///
    /// Values: 48.25 °C, 11.85 V, 1.25 A, 80 %, `wlp1s0` at rx=1000 tx=2000.
    pub fn laptop_on_battery() -> Self {
        let fs = Self::new();

        fs.add_file("/sys/class/thermal/thermal_zone0/type", "x86_pkg_temp\n");
        fs.add_file("/sys/class/thermal/thermal_zone0/temp", "48250\n");

        fs.add_file("/sys/class/power_supply/BAT0/status", "Discharging\n");
        fs.add_file("/sys/class/power_supply/BAT0/voltage_now", "11850000\n");
        fs.add_file("/sys/class/power_supply/BAT0/current_now", "1250000\n");
        fs.add_file("/sys/class/power_supply/BAT0/capacity", "80\n");

        fs.add_file("/sys/class/net/lo/statistics/rx_bytes", "73412\n");
        fs.add_file("/sys/class/net/lo/statistics/tx_bytes", "73412\n");
        fs.add_file("/sys/class/net/wlp1s0/statistics/rx_bytes", "1000\n");
        fs.add_file("/sys/class/net/wlp1s0/statistics/tx_bytes", "2000\n");

        fs.add_file(
            "/proc/net/dev",
            "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:   73412     512    0    0    0     0          0         0    73412     512    0    0    0     0       0          0
wlp1s0:    1000      10    0    0    0     0          0         0     2000      12    0    0    0     0       0          0
",
        );

        fs
    }

    /// Updates the `wlp1s0` counters in both sysfs and `/proc/net/dev`.
    pub fn set_wlp1s0_counters(&self, rx: u64, tx: u64) {
        self.add_file(
            "/sys/class/net/wlp1s0/statistics/rx_bytes",
            format!("{rx}\n"),
        );
        self.add_file(
            "/sys/class/net/wlp1s0/statistics/tx_bytes",
            format!("{tx}\n"),
        );
        self.add_file(
            "/proc/net/dev",
            format!(
                "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:   73412     512    0    0    0     0          0         0    73412     512    0    0    0     0       0          0
wlp1s0: {rx:>7}      10    0    0    0     0          0         0 {tx:>8}      12    0    0    0     0       0          0
"
            ),
        );
    }
}
