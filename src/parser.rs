// ============================================================================
// SAMPLE PARSER
// ============================================================================
// Turns raw nvidia-smi output into `Sample` rows. Two formats share one
// record shape:
// - structured XML (primary, carries the per-GPU process list)
// - delimited CSV (fallback, metrics only)
// ============================================================================

use std::collections::HashSet;

use roxmltree::{Document, Node, ParsingOptions};
use tracing::{debug, trace};

use crate::error::ParseResult;
use crate::negotiate::GpuField;
use crate::sample::{PollStamp, Sample};

/// Output format requested from the metrics tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Structured,
    Delimited,
}

impl OutputFormat {
    /// Value passed to `--format=`
    pub fn format_arg(&self) -> &'static str {
        match self {
            OutputFormat::Structured => "xml",
            OutputFormat::Delimited => "csv,noheader,nounits",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Structured => "structured",
            OutputFormat::Delimited => "delimited",
        }
    }
}

/// Parse one poll's worth of tool output.
///
/// `fields` is the negotiated field order; only the delimited format depends
/// on it since XML elements are self-describing.
pub fn parse(
    raw: &[u8],
    format: OutputFormat,
    fields: &[String],
    stamp: &PollStamp,
) -> ParseResult<Vec<Sample>> {
    let text = std::str::from_utf8(raw)?;
    let samples = match format {
        OutputFormat::Structured => parse_structured(text, stamp)?,
        OutputFormat::Delimited => parse_delimited(text, fields, stamp),
    };
    debug!(
        target: "gpu_doctor::parser",
        format = format.name(),
        samples = samples.len(),
        "Parsed tool output"
    );
    Ok(samples)
}

// ----------------------------------------------------------------------------
// Numeric Coercion
// ----------------------------------------------------------------------------

/// Leading numeric value of a string such as `"45 C"` or `"120.5 W"`.
///
/// Accepts an optional sign, digits and at most one decimal point, stopping at
/// the first other character. No digits means no value.
pub fn strip_units(value: &str) -> Option<f64> {
    let s = value.trim();
    let mut end = 0;
    let mut digits = 0;
    let mut dot_seen = false;

    for (i, ch) in s.char_indices() {
        match ch {
            '+' | '-' if i == 0 => {}
            '0'..='9' => digits += 1,
            '.' if !dot_seen => dot_seen = true,
            _ => break,
        }
        end = i + ch.len_utf8();
    }

    if digits == 0 {
        return None;
    }
    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

fn to_int(value: Option<f64>) -> Option<i64> {
    value.map(|v| v.round() as i64)
}

/// Apply per-field domain rules to a coerced value.
fn normalize(field: GpuField, value: Option<f64>) -> Option<i64> {
    let v = to_int(value)?;
    match field {
        GpuField::UtilizationGpu | GpuField::UtilizationMemory => (0..=100).contains(&v).then_some(v),
        GpuField::MemoryUsed => (v >= 0).then_some(v),
        _ => Some(v),
    }
}

fn parse_id(value: Option<f64>) -> Option<u32> {
    let v = value?;
    if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
        return None;
    }
    Some(v as u32)
}

fn set_metric(sample: &mut Sample, field: GpuField, value: Option<f64>) {
    let v = normalize(field, value);
    match field {
        GpuField::MinorNumber => {}
        GpuField::MemoryUsed => sample.memory_used_mib = v,
        GpuField::UtilizationGpu => sample.utilization_gpu_pct = v,
        GpuField::UtilizationMemory => sample.utilization_mem_pct = v,
        GpuField::Temperature => sample.temperature_c = v,
        GpuField::PowerDraw => sample.power_draw_w = v,
    }
}

/// Reported ids are used only when every GPU has one and none collide.
fn resolve_indices(reported: &[Option<u32>]) -> Vec<u32> {
    let mut seen = HashSet::with_capacity(reported.len());
    let usable = reported.iter().all(|id| matches!(id, Some(i) if seen.insert(*i)));

    if usable {
        reported.iter().flatten().copied().collect()
    } else {
        if !reported.is_empty() {
            debug!(
                target: "gpu_doctor::parser",
                gpus = reported.len(),
                "GPU ids missing or colliding, using positional order"
            );
        }
        (0..reported.len() as u32).collect()
    }
}

// ----------------------------------------------------------------------------
// Structured (XML)
// ----------------------------------------------------------------------------

/// Relative element paths per field, newest layout first
fn xml_paths(field: GpuField) -> &'static [&'static str] {
    match field {
        GpuField::MinorNumber => &["minor_number"],
        GpuField::MemoryUsed => &["fb_memory_usage/used"],
        GpuField::UtilizationGpu => &["utilization/gpu_util"],
        GpuField::UtilizationMemory => &["utilization/memory_util"],
        GpuField::Temperature => &["temperature/gpu_temp"],
        GpuField::PowerDraw => &["power_readings/power_draw", "gpu_power_readings/power_draw"],
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn find_path<'a, 'input>(node: Node<'a, 'input>, path: &str) -> Option<Node<'a, 'input>> {
    path.split('/').try_fold(node, |current, segment| child(current, segment))
}

fn text_at<'a>(node: Node<'a, '_>, path: &str) -> Option<&'a str> {
    find_path(node, path)
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn read_field(gpu: Node<'_, '_>, field: GpuField) -> Option<f64> {
    xml_paths(field)
        .iter()
        .find_map(|path| text_at(gpu, path))
        .and_then(strip_units)
}

fn process_ids(gpu: Node<'_, '_>) -> Vec<u32> {
    let Some(processes) = child(gpu, "processes") else {
        return Vec::new();
    };
    processes
        .children()
        .filter(|c| c.is_element() && c.tag_name().name() == "process_info")
        .filter_map(|info| text_at(info, "pid").and_then(strip_units))
        .filter_map(|v| parse_id(Some(v)))
        .collect()
}

fn parse_structured(text: &str, stamp: &PollStamp) -> ParseResult<Vec<Sample>> {
    // nvidia-smi emits a DOCTYPE line
    let mut options = ParsingOptions::default();
    options.allow_dtd = true;
    let doc = Document::parse_with_options(text, options)?;
    let gpus: Vec<Node<'_, '_>> = doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "gpu")
        .collect();

    let reported: Vec<Option<u32>> = gpus
        .iter()
        .map(|gpu| parse_id(read_field(*gpu, GpuField::MinorNumber)))
        .collect();
    let indices = resolve_indices(&reported);

    let mut samples = Vec::with_capacity(gpus.len());
    for (gpu, index) in gpus.iter().zip(indices) {
        let mut base = Sample::idle(stamp, index);
        for field in GpuField::ALL {
            set_metric(&mut base, field, read_field(*gpu, field));
        }

        let pids = process_ids(*gpu);
        trace!(target: "gpu_doctor::parser", gpu = index, processes = pids.len(), "GPU parsed");
        if pids.is_empty() {
            samples.push(base);
        } else {
            samples.extend(pids.into_iter().map(|pid| base.for_process(pid)));
        }
    }
    Ok(samples)
}

// ----------------------------------------------------------------------------
// Delimited (CSV)
// ----------------------------------------------------------------------------

fn parse_delimited(text: &str, fields: &[String], stamp: &PollStamp) -> Vec<Sample> {
    let columns: Vec<Option<GpuField>> = fields.iter().map(|f| GpuField::from_name(f)).collect();
    let id_column = columns.iter().position(|c| *c == Some(GpuField::MinorNumber));

    let rows: Vec<Vec<Option<f64>>> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut values: Vec<Option<f64>> = line.split(',').map(strip_units).collect();
            // short lines pad with nulls, extra tokens are ignored
            values.resize(columns.len(), None);
            values
        })
        .collect();

    let reported: Vec<Option<u32>> = match id_column {
        Some(col) => rows.iter().map(|row| parse_id(row[col])).collect(),
        None => vec![None; rows.len()],
    };
    let indices = resolve_indices(&reported);

    rows.iter()
        .zip(indices)
        .map(|(row, index)| {
            let mut sample = Sample::idle(stamp, index);
            for (column, value) in columns.iter().zip(row) {
                if let Some(field) = column {
                    set_metric(&mut sample, *field, *value);
                }
            }
            sample
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn stamp() -> PollStamp {
        PollStamp::new(Utc.with_ymd_and_hms(2024, 5, 2, 8, 30, 0).unwrap(), "node-a")
    }

    fn preferred_fields() -> Vec<String> {
        GpuField::ALL.iter().map(|f| f.preferred().to_string()).collect()
    }

    fn legacy_fields() -> Vec<String> {
        GpuField::ALL.iter().map(|f| f.legacy().to_string()).collect()
    }

    const TWO_GPUS: &str = r#"<?xml version="1.0" ?>
<nvidia_smi_log>
  <driver_version>535.104</driver_version>
  <gpu id="00000000:01:00.0">
    <minor_number>0</minor_number>
    <fb_memory_usage><used>10240 MiB</used></fb_memory_usage>
    <utilization><gpu_util>87 %</gpu_util><memory_util>40 %</memory_util></utilization>
    <temperature><gpu_temp>71 C</gpu_temp></temperature>
    <power_readings><power_draw>250.6 W</power_draw></power_readings>
    <processes>
      <process_info><pid>1234</pid><process_name>python</process_name></process_info>
    </processes>
  </gpu>
  <gpu id="00000000:02:00.0">
    <minor_number>1</minor_number>
    <fb_memory_usage><used>0 MiB</used></fb_memory_usage>
    <utilization><gpu_util>0 %</gpu_util><memory_util>0 %</memory_util></utilization>
    <temperature><gpu_temp>35 C</gpu_temp></temperature>
    <gpu_power_readings><power_draw>N/A</power_draw></gpu_power_readings>
    <processes></processes>
  </gpu>
</nvidia_smi_log>"#;

    #[rstest]
    #[case("45 C", Some(45.0))]
    #[case("120.5 W", Some(120.5))]
    #[case("", None)]
    #[case("N/A", None)]
    #[case("-3", Some(-3.0))]
    #[case("+7%", Some(7.0))]
    #[case("  81 %  ", Some(81.0))]
    #[case("1.2.3", Some(1.2))]
    #[case("-", None)]
    #[case(".", None)]
    #[case("[Not Supported]", None)]
    fn test_strip_units(#[case] input: &str, #[case] expected: Option<f64>) {
        assert_eq!(strip_units(input), expected);
    }

    #[test]
    fn test_xml_two_gpus_one_process() {
        let samples = parse(TWO_GPUS.as_bytes(), OutputFormat::Structured, &preferred_fields(), &stamp()).unwrap();
        assert_eq!(samples.len(), 2);

        let busy = &samples[0];
        assert_eq!(busy.gpu_index, 0);
        assert_eq!(busy.process_id, Some(1234));
        assert_eq!(busy.utilization_gpu_pct, Some(87));
        assert_eq!(busy.utilization_mem_pct, Some(40));
        assert_eq!(busy.memory_used_mib, Some(10240));
        assert_eq!(busy.temperature_c, Some(71));
        assert_eq!(busy.power_draw_w, Some(251));
        assert_eq!(busy.host, "node-a");

        let idle = &samples[1];
        assert_eq!(idle.gpu_index, 1);
        assert!(idle.is_idle());
        assert_eq!(idle.power_draw_w, None);
        assert_eq!(idle.timestamp, busy.timestamp);
    }

    #[test]
    fn test_xml_with_doctype() {
        let xml = r#"<?xml version="1.0" ?>
<!DOCTYPE nvidia_smi_log SYSTEM "nvsmi_device_v12.dtd">
<nvidia_smi_log><gpu><minor_number>2</minor_number></gpu></nvidia_smi_log>"#;
        let samples = parse(xml.as_bytes(), OutputFormat::Structured, &[], &stamp()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].gpu_index, 2);
    }

    #[test]
    fn test_xml_power_fallback_path() {
        let xml = r#"<log><gpu><minor_number>3</minor_number>
            <gpu_power_readings><power_draw>99.4 W</power_draw></gpu_power_readings></gpu></log>"#;
        let samples = parse(xml.as_bytes(), OutputFormat::Structured, &[], &stamp()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].gpu_index, 3);
        assert_eq!(samples[0].power_draw_w, Some(99));
    }

    #[test]
    fn test_xml_multiple_processes_share_metrics() {
        let xml = r#"<log><gpu><minor_number>0</minor_number>
            <utilization><gpu_util>55 %</gpu_util></utilization>
            <processes>
              <process_info><pid>10</pid></process_info>
              <process_info><pid>not-a-pid</pid></process_info>
              <process_info><pid>11</pid></process_info>
            </processes></gpu></log>"#;
        let samples = parse(xml.as_bytes(), OutputFormat::Structured, &[], &stamp()).unwrap();

        let pids: Vec<Option<u32>> = samples.iter().map(|s| s.process_id).collect();
        assert_eq!(pids, vec![Some(10), Some(11)]);
        assert!(samples.iter().all(|s| s.utilization_gpu_pct == Some(55)));
    }

    #[test]
    fn test_xml_missing_id_uses_positions() {
        let xml = r#"<log>
            <gpu><minor_number>5</minor_number></gpu>
            <gpu><minor_number>N/A</minor_number></gpu>
            <gpu><minor_number>7</minor_number></gpu></log>"#;
        let samples = parse(xml.as_bytes(), OutputFormat::Structured, &[], &stamp()).unwrap();
        let ids: Vec<u32> = samples.iter().map(|s| s.gpu_index).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_xml_colliding_ids_use_positions() {
        let xml = r#"<log>
            <gpu><minor_number>0</minor_number></gpu>
            <gpu><minor_number>0</minor_number></gpu></log>"#;
        let samples = parse(xml.as_bytes(), OutputFormat::Structured, &[], &stamp()).unwrap();
        let ids: Vec<u32> = samples.iter().map(|s| s.gpu_index).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_xml_out_of_range_values_are_null() {
        let xml = r#"<log><gpu><minor_number>0</minor_number>
            <utilization><gpu_util>140 %</gpu_util><memory_util>-1 %</memory_util></utilization>
            <fb_memory_usage><used>-20 MiB</used></fb_memory_usage>
            <temperature><gpu_temp>-5 C</gpu_temp></temperature></gpu></log>"#;
        let samples = parse(xml.as_bytes(), OutputFormat::Structured, &[], &stamp()).unwrap();
        let s = &samples[0];
        assert_eq!(s.utilization_gpu_pct, None);
        assert_eq!(s.utilization_mem_pct, None);
        assert_eq!(s.memory_used_mib, None);
        assert_eq!(s.temperature_c, Some(-5));
    }

    #[test]
    fn test_xml_malformed_is_error() {
        let err = parse(b"<log><gpu>", OutputFormat::Structured, &[], &stamp());
        assert!(err.is_err());
    }

    #[test]
    fn test_non_utf8_is_error() {
        let err = parse(&[0xff, 0xfe, 0x00], OutputFormat::Delimited, &[], &stamp());
        assert!(err.is_err());
    }

    #[test]
    fn test_xml_no_gpus_yields_nothing() {
        let samples = parse(b"<nvidia_smi_log/>", OutputFormat::Structured, &[], &stamp()).unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_csv_legacy_fields() {
        let raw = "0, 10240, 87, 40, 71, 250.60\n1, 0, 0, 0, 35, [N/A]\n\n";
        let samples = parse(raw.as_bytes(), OutputFormat::Delimited, &legacy_fields(), &stamp()).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].gpu_index, 0);
        assert_eq!(samples[0].memory_used_mib, Some(10240));
        assert_eq!(samples[0].power_draw_w, Some(251));
        assert_eq!(samples[1].gpu_index, 1);
        assert_eq!(samples[1].power_draw_w, None);
        assert!(samples.iter().all(Sample::is_idle));
    }

    #[test]
    fn test_csv_without_id_column_is_positional() {
        let fields = vec!["utilization.gpu".to_string(), "memory.used".to_string()];
        let samples = parse(b"12, 300\n13, 400\n", OutputFormat::Delimited, &fields, &stamp()).unwrap();
        let ids: Vec<u32> = samples.iter().map(|s| s.gpu_index).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(samples[1].memory_used_mib, Some(400));
    }

    #[test]
    fn test_csv_extra_tokens_ignored() {
        let fields = vec!["index".to_string(), "temperature.gpu".to_string()];
        let samples = parse(b"2, 60, 999, 12\n", OutputFormat::Delimited, &fields, &stamp()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].gpu_index, 2);
        assert_eq!(samples[0].temperature_c, Some(60));
        assert_eq!(samples[0].memory_used_mib, None);
    }

    proptest! {
        #[test]
        fn prop_csv_short_lines_pad_with_nulls(tokens in prop::collection::vec(0u32..100, 1..10)) {
            let fields = legacy_fields();
            let line = tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ");
            let samples = parse(line.as_bytes(), OutputFormat::Delimited, &fields, &stamp()).unwrap();

            prop_assert_eq!(samples.len(), 1);
            let s = &samples[0];
            prop_assert_eq!(s.gpu_index, tokens[0]);

            let expect = |col: usize| tokens.get(col).map(|v| *v as i64);
            prop_assert_eq!(s.memory_used_mib, expect(1));
            prop_assert_eq!(s.utilization_gpu_pct, expect(2));
            prop_assert_eq!(s.utilization_mem_pct, expect(3));
            prop_assert_eq!(s.temperature_c, expect(4));
            prop_assert_eq!(s.power_draw_w, expect(5));
            prop_assert!(s.is_idle());
        }
    }
}
