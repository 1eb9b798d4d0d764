//! SHT4x Trinkey over USB serial.
//!
//! The board prints one line per measurement:
//! `<id>, <temp °C>, <humidity %>[, ...]`

use std::io::{ErrorKind, Read};
use std::time::Duration;

use boatwatch_core::{Reading, ResourceError, SampleError, SampleSource};
use serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, info};

/// Anything hotter than boiling water is a corrupted line.
pub const MAX_FAHRENHEIT: f64 = 212.0;
const MAX_LINE: usize = 256;
/// Consecutive port timeouts tolerated while waiting for a line to start.
pub const MAX_IDLE_TIMEOUTS: u32 = 10;

/// Find the first USB serial port whose product string contains `description`.
pub fn find_device(description: &str) -> Result<String, ResourceError> {
    let ports = serialport::available_ports().map_err(|e| ResourceError::Open {
        resource: "serial port list".to_string(),
        reason: e.to_string(),
    })?;
    debug!(count = ports.len(), "Enumerated serial ports");

    select_port(&ports, description)
        .ok_or_else(|| ResourceError::DeviceNotFound(description.to_string()))
}

fn select_port(ports: &[SerialPortInfo], description: &str) -> Option<String> {
    ports.iter().find_map(|port| match &port.port_type {
        SerialPortType::UsbPort(usb)
            if usb
                .product
                .as_deref()
                .is_some_and(|product| product.contains(description)) =>
        {
            Some(port.port_name.clone())
        }
        _ => None,
    })
}

pub struct SerialLineSource {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialLineSource {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, ResourceError> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| ResourceError::Open {
                resource: path.to_string(),
                reason: e.to_string(),
            })?;
        info!(port = path, baud_rate, "Serial port open");

        Ok(Self {
            port,
            name: path.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SampleSource for SerialLineSource {
    fn read(&mut self) -> Result<Reading, SampleError> {
        // stale lines pile up between slow cycles
        self.port.clear(ClearBuffer::Input).map_err(std::io::Error::from)?;
        // after the flush we are likely mid-line
        read_line(&mut self.port, MAX_IDLE_TIMEOUTS)?;
        let line = read_line(&mut self.port, MAX_IDLE_TIMEOUTS)?;
        parse_line(&line)
    }
}

/// Read up to and excluding the next `\n`.
///
/// Port timeouts before the first byte mean the sensor has not printed yet
/// and are retried up to `max_idle` times. A timeout mid-line is an error.
pub fn read_line<R: Read + ?Sized>(reader: &mut R, max_idle: u32) -> Result<String, SampleError> {
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    let mut idle = 0;

    loop {
        match reader.read(&mut byte) {
            Ok(0) => {
                if buf.is_empty() {
                    return Err(SampleError::Empty);
                }
                break;
            }
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => {
                buf.push(byte[0]);
                if buf.len() > MAX_LINE {
                    return Err(SampleError::malformed(
                        String::from_utf8_lossy(&buf),
                        "line too long",
                    ));
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::TimedOut && buf.is_empty() && idle < max_idle => {
                idle += 1;
            }
            Err(e) => return Err(SampleError::Io(e)),
        }
    }

    let line = String::from_utf8_lossy(&buf);
    Ok(line.trim_end_matches('\r').to_string())
}

/// Parse one Trinkey line into °F and relative humidity.
pub fn parse_line(line: &str) -> Result<Reading, SampleError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 {
        return Err(SampleError::malformed(
            line,
            format!("expected at least 3 fields, got {}", fields.len()),
        ));
    }

    let celsius = parse_field(line, fields[1], "temperature")?;
    let humidity = parse_field(line, fields[2], "humidity")?;

    let fahrenheit = celsius * 9.0 / 5.0 + 32.0;
    if fahrenheit > MAX_FAHRENHEIT {
        return Err(SampleError::OutOfRange {
            value: fahrenheit,
            max: MAX_FAHRENHEIT,
        });
    }

    Ok(Reading::new(fahrenheit).with_secondary(humidity))
}

fn parse_field(line: &str, field: &str, what: &str) -> Result<f64, SampleError> {
    match field.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(SampleError::malformed(line, format!("{} {:?} is not a number", what, field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;
    use std::io::Cursor;

    #[test]
    fn test_parse_converts_to_fahrenheit() {
        let reading = parse_line("1, 23.0, 41.5").unwrap();
        assert!((reading.value() - 73.4).abs() < 1e-9);
        assert_eq!(reading.secondary(), &[41.5]);
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let reading = parse_line("7,0.0,50.0,ok,extra").unwrap();
        assert_eq!(reading.value(), 32.0);
    }

    #[test]
    fn test_short_or_garbage_lines_are_rejected() {
        assert!(matches!(parse_line("abc, notanumber"), Err(SampleError::Malformed { .. })));
        assert!(matches!(parse_line(""), Err(SampleError::Malformed { .. })));
        assert!(matches!(parse_line("1, warm, 40"), Err(SampleError::Malformed { .. })));
        assert!(matches!(parse_line("1, 20, NaN"), Err(SampleError::Malformed { .. })));
    }

    #[test]
    fn test_above_boiling_is_out_of_range() {
        // 100.5 °C = 212.9 °F
        let err = parse_line("1, 100.5, 10").unwrap_err();
        assert!(matches!(err, SampleError::OutOfRange { max, .. } if max == MAX_FAHRENHEIT));
        assert!(parse_line("1, 100.0, 10").is_ok());
    }

    #[test]
    fn test_read_line_splits_on_newline() {
        let mut input = Cursor::new(b"45.2, 60\r\n1, 22.5, 40.1\n".to_vec());
        assert_eq!(read_line(&mut input, 0).unwrap(), "45.2, 60");
        assert_eq!(read_line(&mut input, 0).unwrap(), "1, 22.5, 40.1");
        assert!(matches!(read_line(&mut input, 0), Err(SampleError::Empty)));
    }

    #[test]
    fn test_read_line_caps_length() {
        let mut input = Cursor::new(vec![b'x'; MAX_LINE + 10]);
        assert!(matches!(read_line(&mut input, 0), Err(SampleError::Malformed { .. })));
    }

    /// Serial port that times out `timeouts` times before each chunk.
    struct SlowPort {
        chunks: Vec<&'static [u8]>,
        timeouts: u32,
        pending_timeouts: u32,
        pos: usize,
    }

    impl SlowPort {
        fn new(timeouts: u32, chunks: Vec<&'static [u8]>) -> Self {
            Self {
                chunks,
                timeouts,
                pending_timeouts: timeouts,
                pos: 0,
            }
        }
    }

    impl Read for SlowPort {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            if self.pending_timeouts > 0 {
                self.pending_timeouts -= 1;
                return Err(std::io::Error::new(ErrorKind::TimedOut, "Operation timed out"));
            }
            let Some(chunk) = self.chunks.first() else {
                return Ok(0);
            };
            out[0] = chunk[self.pos];
            self.pos += 1;
            if self.pos == chunk.len() {
                self.chunks.remove(0);
                self.pos = 0;
                self.pending_timeouts = self.timeouts;
            }
            Ok(1)
        }
    }

    #[test]
    fn test_idle_port_waits_for_next_line() {
        let mut port = SlowPort::new(1, vec![&b"1, 22.5, 40.1\n"[..]]);
        assert_eq!(read_line(&mut port, MAX_IDLE_TIMEOUTS).unwrap(), "1, 22.5, 40.1");
    }

    #[test]
    fn test_idle_limit_is_bounded() {
        let mut port = SlowPort::new(3, vec![&b"1, 22.5, 40.1\n"[..]]);
        let err = read_line(&mut port, 2).unwrap_err();
        assert!(matches!(err, SampleError::Io(ref e) if e.kind() == ErrorKind::TimedOut));
    }

    #[test]
    fn test_timeout_mid_line_is_an_error() {
        let mut port = SlowPort::new(1, vec![&b"1, 22"[..], &b".5, 40.1\n"[..]]);
        // the first chunk is preceded by one idle timeout, the second by one mid-line
        let err = read_line(&mut port, MAX_IDLE_TIMEOUTS).unwrap_err();
        assert!(matches!(err, SampleError::Io(ref e) if e.kind() == ErrorKind::TimedOut));
    }

    fn usb(name: &str, product: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x239a,
                pid: 0x8120,
                serial_number: None,
                manufacturer: Some("Adafruit".to_string()),
                product: product.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_select_port_by_product() {
        let ports = vec![
            SerialPortInfo {
                port_name: "/dev/ttyS0".to_string(),
                port_type: SerialPortType::Unknown,
            },
            usb("/dev/ttyACM0", Some("Feather M4")),
            usb("/dev/ttyACM1", None),
            usb("/dev/ttyACM2", Some("SHT4x Trinkey M0")),
        ];

        assert_eq!(
            select_port(&ports, "SHT4x Trinkey M0").as_deref(),
            Some("/dev/ttyACM2")
        );
        assert_eq!(select_port(&ports, "Nothing"), None);
    }
}
