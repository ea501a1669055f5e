use std::fmt;

use crate::calendar::Cadence;

/// The closed set of datasets published by the Tokyo epidemic surveillance
/// system. Each variant carries its upstream endpoint and report-type code,
/// so dispatch is exhaustive at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum SeriesKind {
    SentinelWeeklyGender,
    SentinelWeeklyAge,
    SentinelWeeklyHealthCenter,
    SentinelWeeklyMedicalDistrict,
    SentinelMonthlyGender,
    SentinelMonthlyAge,
    SentinelMonthlyHealthCenter,
    SentinelMonthlyMedicalDistrict,
    NotifiableWeekly,
}

impl SeriesKind {
    pub const ALL: [SeriesKind; 9] = [
        SeriesKind::SentinelWeeklyGender,
        SeriesKind::SentinelWeeklyAge,
        SeriesKind::SentinelWeeklyHealthCenter,
        SeriesKind::SentinelWeeklyMedicalDistrict,
        SeriesKind::SentinelMonthlyGender,
        SeriesKind::SentinelMonthlyAge,
        SeriesKind::SentinelMonthlyHealthCenter,
        SeriesKind::SentinelMonthlyMedicalDistrict,
        SeriesKind::NotifiableWeekly,
    ];

    /// Canonical series name; also the filename prefix for stored artifacts.
    pub fn name(&self) -> &'static str {
        match self {
            SeriesKind::SentinelWeeklyGender => "sentinel_weekly_gender",
            SeriesKind::SentinelWeeklyAge => "sentinel_weekly_age",
            SeriesKind::SentinelWeeklyHealthCenter => "sentinel_weekly_health_center",
            SeriesKind::SentinelWeeklyMedicalDistrict => "sentinel_weekly_medical_district",
            SeriesKind::SentinelMonthlyGender => "sentinel_monthly_gender",
            SeriesKind::SentinelMonthlyAge => "sentinel_monthly_age",
            SeriesKind::SentinelMonthlyHealthCenter => "sentinel_monthly_health_center",
            SeriesKind::SentinelMonthlyMedicalDistrict => "sentinel_monthly_medical_district",
            SeriesKind::NotifiableWeekly => "notifiable_weekly",
        }
    }

    pub fn cadence(&self) -> Cadence {
        match self {
            SeriesKind::SentinelMonthlyGender
            | SeriesKind::SentinelMonthlyAge
            | SeriesKind::SentinelMonthlyHealthCenter
            | SeriesKind::SentinelMonthlyMedicalDistrict => Cadence::Monthly,
            _ => Cadence::Weekly,
        }
    }

    /// Download endpoint, relative to the upstream base URL.
    pub fn endpoint(&self) -> &'static str {
        match self {
            SeriesKind::SentinelWeeklyGender => "dlwgender.do",
            SeriesKind::SentinelWeeklyAge => "dlwage.do",
            SeriesKind::SentinelWeeklyHealthCenter => "dlwhc.do",
            SeriesKind::SentinelWeeklyMedicalDistrict => "dlwzone.do",
            SeriesKind::SentinelMonthlyGender => "dlmgender.do",
            SeriesKind::SentinelMonthlyAge => "dlmage.do",
            SeriesKind::SentinelMonthlyHealthCenter => "dlmhc.do",
            SeriesKind::SentinelMonthlyMedicalDistrict => "dlmzone.do",
            SeriesKind::NotifiableWeekly => "dlwzensu.do",
        }
    }

    /// Upstream `val(reportType)` form field.
    pub fn report_type(&self) -> &'static str {
        match self {
            SeriesKind::SentinelWeeklyGender => "1",
            SeriesKind::SentinelWeeklyAge => "0",
            SeriesKind::SentinelWeeklyHealthCenter => "2",
            SeriesKind::SentinelWeeklyMedicalDistrict => "5",
            SeriesKind::SentinelMonthlyGender => "15",
            SeriesKind::SentinelMonthlyAge => "10",
            SeriesKind::SentinelMonthlyHealthCenter => "11",
            SeriesKind::SentinelMonthlyMedicalDistrict => "12",
            SeriesKind::NotifiableWeekly => "20",
        }
    }

    /// Disease code. Health-center, medical-district and notifiable tables
    /// expect an empty code; everything else uses "00" (all diseases).
    pub fn epid_code(&self) -> &'static str {
        match self {
            SeriesKind::SentinelWeeklyHealthCenter
            | SeriesKind::SentinelWeeklyMedicalDistrict
            | SeriesKind::SentinelMonthlyHealthCenter
            | SeriesKind::SentinelMonthlyMedicalDistrict
            | SeriesKind::NotifiableWeekly => "",
            _ => "00",
        }
    }
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
