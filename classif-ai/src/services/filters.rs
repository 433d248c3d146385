//! Typed analysis filters
//!
//! Parsed once at the boundary from the query-string contract
//! (`ml_model_id__in=1,2&date__gte=2024-01-01&meta_info__LotId__in=A,B`).
//! Unknown keys are rejected instead of silently ignored.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use classif_common::db::{ClassificationType, File, FileSet, UseCase};
use classif_common::time::parse_iso_date;
use serde::Serialize;

use crate::error::{AnalysisError, AnalysisResult};

const META_PREFIX: &str = "meta_info__";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterCriteria {
    /// `id__in` / `file_set_id__in`
    pub file_set_ids: Option<Vec<i64>>,
    /// `use_case_id__in`
    pub use_case_ids: Option<Vec<i64>>,
    /// `ml_model_id__in`
    pub ml_model_ids: Option<Vec<i64>>,
    /// `date__gte`, inclusive, on the file set upload date
    pub date_from: Option<NaiveDate>,
    /// `date__lte`, inclusive
    pub date_to: Option<NaiveDate>,
    /// `train_type__in`
    pub train_types: Option<Vec<String>>,
    /// `classification_type`
    pub classification_type: Option<ClassificationType>,
    /// `meta_info__<field>__in`
    pub meta_info: BTreeMap<String, Vec<String>>,
    /// `auto_model=true`: pick the deployed model per file set
    pub auto_model: bool,
}

impl FilterCriteria {
    pub fn from_query_string(query: &str) -> AnalysisResult<Self> {
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> AnalysisResult<Self> {
        let mut criteria = FilterCriteria::default();

        for (key, value) in pairs {
            let value = value.trim();
            match key {
                "id__in" | "file_set_id__in" => {
                    extend(&mut criteria.file_set_ids, parse_ids(key, value)?)
                }
                "use_case_id__in" => extend(&mut criteria.use_case_ids, parse_ids(key, value)?),
                "ml_model_id__in" => extend(&mut criteria.ml_model_ids, parse_ids(key, value)?),
                "date__gte" => criteria.date_from = Some(parse_iso_date(value)?),
                "date__lte" => criteria.date_to = Some(parse_iso_date(value)?),
                "train_type__in" => extend(&mut criteria.train_types, split_list(value)),
                "classification_type" => {
                    criteria.classification_type = Some(ClassificationType::parse(value)?)
                }
                "auto_model" => criteria.auto_model = parse_bool(key, value)?,
                _ => {
                    let Some(field) = key
                        .strip_prefix(META_PREFIX)
                        .map(|rest| rest.strip_suffix("__in").unwrap_or(rest))
                        .filter(|field| !field.is_empty())
                    else {
                        return Err(AnalysisError::BadRequest(format!(
                            "Unknown filter '{}'",
                            key
                        )));
                    };
                    criteria
                        .meta_info
                        .entry(field.to_string())
                        .or_default()
                        .extend(split_list(value));
                }
            }
        }

        Ok(criteria)
    }

    /// Metric endpoints need at least one model unless auto-model is on
    pub fn validate_for_metrics(&self) -> AnalysisResult<()> {
        let has_models = self.ml_model_ids.as_ref().is_some_and(|ids| !ids.is_empty());
        if !has_models && !self.auto_model {
            return Err(AnalysisError::BadRequest(
                "ml_model_id__in is required unless auto_model=true".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(AnalysisError::BadRequest(format!(
                    "date__gte ({}) is after date__lte ({})",
                    from, to
                )));
            }
        }
        Ok(())
    }

    /// File set level predicates (ids, use case, dates, meta info)
    pub fn matches_file_set(&self, file_set: &FileSet, use_case: Option<&UseCase>) -> bool {
        if let Some(ids) = &self.file_set_ids {
            if !ids.contains(&file_set.id) {
                return false;
            }
        }
        if let Some(ids) = &self.use_case_ids {
            if !ids.contains(&file_set.use_case_id) {
                return false;
            }
        }
        if let Some(wanted) = self.classification_type {
            if use_case.map(|uc| uc.classification_type) != Some(wanted) {
                return false;
            }
        }

        let date = file_set.created_at.date_naive();
        if self.date_from.is_some_and(|from| date < from) || self.date_to.is_some_and(|to| date > to) {
            return false;
        }

        self.meta_info.iter().all(|(field, allowed)| {
            file_set
                .meta_str(field)
                .is_some_and(|actual| allowed.iter().any(|a| *a == actual))
        })
    }

    pub fn matches_file(&self, file: &File) -> bool {
        match &self.train_types {
            Some(types) => file
                .train_type
                .as_ref()
                .is_some_and(|t| types.iter().any(|wanted| wanted == t)),
            None => true,
        }
    }

    pub fn selects_model(&self, ml_model_id: i64) -> bool {
        self.ml_model_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&ml_model_id))
    }
}

fn extend<T>(target: &mut Option<Vec<T>>, values: Vec<T>) {
    target.get_or_insert_with(Vec::new).extend(values);
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_ids(key: &str, value: &str) -> AnalysisResult<Vec<i64>> {
    split_list(value)
        .iter()
        .map(|v| {
            v.parse::<i64>().map_err(|_| {
                AnalysisError::BadRequest(format!("{} expects integer ids, got '{}'", key, v))
            })
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> AnalysisResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(AnalysisError::BadRequest(format!(
            "{} expects a boolean, got '{}'",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_query_string_parses_every_filter() {
        let criteria = FilterCriteria::from_query_string(
            "ml_model_id__in=3,4&use_case_id__in=1&date__gte=2024-01-01&date__lte=2024-01-31\
             &train_type__in=TRAIN,TEST&classification_type=SINGLE_LABEL\
             &meta_info__LotId__in=L1,L2&meta_info__MachineNo=M7&id__in=10",
        )
        .unwrap();

        assert_eq!(criteria.ml_model_ids, Some(vec![3, 4]));
        assert_eq!(criteria.use_case_ids, Some(vec![1]));
        assert_eq!(criteria.file_set_ids, Some(vec![10]));
        assert_eq!(criteria.date_from, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(criteria.date_to, NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(
            criteria.train_types,
            Some(vec!["TRAIN".to_string(), "TEST".to_string()])
        );
        assert_eq!(criteria.classification_type, Some(ClassificationType::SingleLabel));
        assert_eq!(criteria.meta_info["LotId"], vec!["L1", "L2"]);
        assert_eq!(criteria.meta_info["MachineNo"], vec!["M7"]);
        assert!(criteria.validate_for_metrics().is_ok());
    }

    #[test]
    fn test_rejects_unknown_keys_and_bad_values() {
        for query in [
            "colour=red",
            "ml_model_id__in=a",
            "date__gte=01-02-2024",
            "classification_type=FUZZY",
            "meta_info__=x",
        ] {
            let err = FilterCriteria::from_query_string(query).unwrap_err();
            assert_eq!(err.status_code(), 400, "{}", query);
        }
    }

    #[test]
    fn test_metrics_require_models_unless_auto() {
        let none = FilterCriteria::default();
        assert!(none.validate_for_metrics().is_err());

        let auto = FilterCriteria::from_query_string("auto_model=true").unwrap();
        assert!(auto.validate_for_metrics().is_ok());

        let inverted =
            FilterCriteria::from_query_string("ml_model_id__in=1&date__gte=2024-02-01&date__lte=2024-01-01")
                .unwrap();
        assert!(inverted.validate_for_metrics().is_err());
    }

    #[test]
    fn test_matches_file_set_on_dates_and_meta() {
        let file_set = FileSet {
            id: 5,
            use_case_id: 1,
            meta_info: json!({"LotId": "L1"}).as_object().cloned().unwrap(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap(),
        };

        let inside = FilterCriteria::from_query_string("date__lte=2024-01-31&meta_info__LotId__in=L1").unwrap();
        assert!(inside.matches_file_set(&file_set, None));

        let outside = FilterCriteria::from_query_string("date__gte=2024-02-01").unwrap();
        assert!(!outside.matches_file_set(&file_set, None));

        let other_lot = FilterCriteria::from_query_string("meta_info__LotId__in=L2").unwrap();
        assert!(!other_lot.matches_file_set(&file_set, None));
    }
}
