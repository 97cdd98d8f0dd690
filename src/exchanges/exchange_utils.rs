use std::fmt;

use serde::{
    de::{self, SeqAccess, Visitor},
    Deserialize, Deserializer,
};

#[derive(Debug)]
struct StringF64ArrayLen2Visitor;

impl<'a> Visitor<'a> for StringF64ArrayLen2Visitor {
    type Value = Vec<[f64; 2]>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a vector of two-element arrays of strings representing floats")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'a>,
    {
        let mut vec = vec![];

        while let Some(arr) = seq.next_element::<[String; 2]>()? {
            let first: f64 = arr[0].parse().map_err(de::Error::custom)?;
            let second: f64 = arr[1].parse().map_err(de::Error::custom)?;
            vec.push([first, second]);
        }

        Ok(vec)
    }
}

/// Converts venue level rows of decimal strings, ie. `[["100.5", "0.25"]]`,
/// into `[price, size]` pairs.
pub fn convert_array_len_2_to_f64<'a, D>(deserializer: D) -> Result<Vec<[f64; 2]>, D::Error>
where
    D: Deserializer<'a>,
{
    deserializer.deserialize_seq(StringF64ArrayLen2Visitor)
}

#[derive(Debug)]
struct StringF64ArrayLen3Visitor;

impl<'a> Visitor<'a> for StringF64ArrayLen3Visitor {
    type Value = Vec<[f64; 3]>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a vector of three-element arrays of strings representing floats")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'a>,
    {
        let mut vec = vec![];

        while let Some(arr) = seq.next_element::<[String; 3]>()? {
            let first: f64 = arr[0].parse().map_err(de::Error::custom)?;
            let second: f64 = arr[1].parse().map_err(de::Error::custom)?;
            let third: f64 = arr[2].parse().map_err(de::Error::custom)?;
            vec.push([first, second, third]);
        }

        Ok(vec)
    }
}

/// KuCoin change rows carry a per-row sequence as a third element.
pub fn convert_array_len_3_to_f64<'a, D>(deserializer: D) -> Result<Vec<[f64; 3]>, D::Error>
where
    D: Deserializer<'a>,
{
    deserializer.deserialize_seq(StringF64ArrayLen3Visitor)
}

pub fn convert_from_string_to_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<u64>().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde_derive::Deserialize;

    #[derive(Deserialize)]
    struct Levels {
        #[serde(deserialize_with = "super::convert_array_len_2_to_f64")]
        bids: Vec<[f64; 2]>,
        #[serde(deserialize_with = "super::convert_array_len_3_to_f64")]
        changes: Vec<[f64; 3]>,
        #[serde(deserialize_with = "super::convert_from_string_to_u64")]
        sequence: u64,
    }

    #[test]
    fn test_decimal_string_rows() {
        let levels: Levels = serde_json::from_str(
            r#"{
                "bids": [["100.5", "0.25"], ["100.4", "0"]],
                "changes": [["100.5", "0.25", "17"]],
                "sequence": "1545896707028"
            }"#,
        )
        .unwrap();

        assert_eq!(levels.bids, vec![[100.5, 0.25], [100.4, 0.0]]);
        assert_eq!(levels.changes, vec![[100.5, 0.25, 17.0]]);
        assert_eq!(levels.sequence, 1545896707028);
    }
}
