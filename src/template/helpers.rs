//! Built-in template helpers (spec.md §4.1, §9 "Sprig/template helpers").
//!
//! Only the helpers actually referenced by the bundled example templates are
//! implemented — additional helpers are pure functions addable here without
//! touching the parser.

use sha2::{Digest, Sha256};

use crate::error::RenderError;

/// One helper invocation's string arguments, already substituted for any
/// nested `.Field` references.
pub type Args<'a> = [String];

fn arg(args: &Args, i: usize, helper: &str) -> Result<&str, RenderError> {
    args.get(i).map(String::as_str).ok_or_else(|| RenderError::BadHelperArgs {
        helper: helper.to_string(),
        detail: format!("expected at least {} argument(s), got {}", i + 1, args.len()),
    })
}

fn arg_i64(args: &Args, i: usize, helper: &str) -> Result<i64, RenderError> {
    arg(args, i, helper)?.parse::<i64>().map_err(|e| RenderError::BadHelperArgs {
        helper: helper.to_string(),
        detail: format!("argument {i} is not an integer: {e}"),
    })
}

/// Dispatch one helper call by name. Returns the substituted string.
pub fn call(name: &str, args: &Args) -> Result<String, RenderError> {
    match name {
        "hashSha256" => {
            let input = arg(args, 0, name)?;
            let mut hasher = Sha256::new();
            hasher.update(input.as_bytes());
            Ok(format!("{:x}", hasher.finalize()))
        }
        "toUpper" => Ok(arg(args, 0, name)?.to_uppercase()),
        "toLower" => Ok(arg(args, 0, name)?.to_lowercase()),
        "add" => Ok((arg_i64(args, 0, name)? + arg_i64(args, 1, name)?).to_string()),
        "sub" => Ok((arg_i64(args, 0, name)? - arg_i64(args, 1, name)?).to_string()),
        "mul" => Ok((arg_i64(args, 0, name)? * arg_i64(args, 1, name)?).to_string()),
        "mod" => {
            let divisor = arg_i64(args, 1, name)?;
            if divisor == 0 {
                return Err(RenderError::BadHelperArgs {
                    helper: name.to_string(),
                    detail: "division by zero".to_string(),
                });
            }
            Ok((arg_i64(args, 0, name)? % divisor).to_string())
        }
        "subnetFor24" => Ok(subnet_for_24(arg_i64(args, 0, name)?)),
        "binomial" => Ok(binomial(arg_i64(args, 0, name)?, arg_i64(args, 1, name)?).to_string()),
        "indexToCombination" => {
            let n = arg_i64(args, 0, name)?;
            let k = arg_i64(args, 1, name)?;
            let idx = arg_i64(args, 2, name)?;
            let combo = index_to_combination(n, k, idx).map_err(|detail| RenderError::BadHelperArgs {
                helper: name.to_string(),
                detail,
            })?;
            Ok(combo.iter().map(i64::to_string).collect::<Vec<_>>().join(","))
        }
        "randAlphaNum" => {
            let len = arg_i64(args, 0, name)?.max(0) as usize;
            let seed = arg_i64(args, 1, name)?;
            Ok(rand_alpha_num(len, seed as u64))
        }
        other => Err(RenderError::UnknownHelper(other.to_string())),
    }
}

/// `subnetFor24(i) = "(i>>16+1).(i>>8 & 255).(i & 255).0/24"`, matching spec.md §4.1.
pub fn subnet_for_24(i: i64) -> String {
    let i = i as u32 as u64 & 0xFFFF_FFFF;
    let a = (i >> 16 & 0xFF) + 1;
    let b = i >> 8 & 0xFF;
    let c = i & 0xFF;
    format!("{a}.{b}.{c}.0/24")
}

/// Binomial coefficient C(n, k), computed without overflow for the modest
/// combinatorial sizes these templates generate topology matrices for.
pub fn binomial(n: i64, k: i64) -> i64 {
    if k < 0 || k > n || n < 0 {
        return 0;
    }
    let k = k.min(n - k);
    let mut result: i64 = 1;
    for i in 0..k {
        result = result * (n - i) / (i + 1);
    }
    result
}

/// Maps a combination index in `[0, C(n,k))` to the `idx`-th k-combination of
/// `{0, ..., n-1}` in colex order, the standard index<->combination bijection.
pub fn index_to_combination(n: i64, k: i64, mut idx: i64) -> Result<Vec<i64>, String> {
    if k < 0 || n < 0 {
        return Err("n and k must be non-negative".to_string());
    }
    let total = binomial(n, k);
    if idx < 0 || idx >= total {
        return Err(format!("index {idx} out of range [0, {total})"));
    }
    let mut combo = Vec::with_capacity(k as usize);
    let mut remaining_k = k;
    let mut upper = n - 1;
    while remaining_k > 0 {
        let mut candidate = upper;
        while binomial(candidate, remaining_k) > idx {
            candidate -= 1;
        }
        idx -= binomial(candidate, remaining_k);
        combo.push(candidate);
        upper = candidate - 1;
        remaining_k -= 1;
    }
    combo.reverse();
    Ok(combo)
}

const ALPHANUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Deterministic pseudo-random alphanumeric string, seeded explicitly so
/// rendering stays a pure function of its inputs (spec.md §8: "re-running
/// template rendering with the same inputs yields byte-identical output").
pub fn rand_alpha_num(len: usize, mut seed: u64) -> String {
    let mut out = String::with_capacity(len);
    for _ in 0..len {
        // xorshift64 — cheap, deterministic, good enough for non-cryptographic filler.
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.push(ALPHANUM[(seed as usize) % ALPHANUM.len()] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_for_24_matches_spec_formula() {
        assert_eq!(subnet_for_24(0), "1.0.0.0/24");
        assert_eq!(subnet_for_24(1), "1.0.1.0/24");
        assert_eq!(subnet_for_24(256), "1.1.0.0/24");
        assert_eq!(subnet_for_24(65536), "2.0.0.0/24");
    }

    #[test]
    fn binomial_known_values() {
        assert_eq!(binomial(5, 2), 10);
        assert_eq!(binomial(10, 0), 1);
        assert_eq!(binomial(10, 10), 1);
        assert_eq!(binomial(5, 6), 0);
    }

    #[test]
    fn index_to_combination_round_trips_over_full_range() {
        let n = 6;
        let k = 3;
        let total = binomial(n, k);
        let mut seen = std::collections::HashSet::new();
        for idx in 0..total {
            let combo = index_to_combination(n, k, idx).unwrap();
            assert_eq!(combo.len(), k as usize);
            assert!(combo.windows(2).all(|w| w[0] < w[1]), "combination must be strictly increasing");
            assert!(seen.insert(combo));
        }
        assert_eq!(seen.len() as i64, total);
    }

    #[test]
    fn index_to_combination_rejects_out_of_range() {
        assert!(index_to_combination(5, 2, 100).is_err());
    }

    #[test]
    fn rand_alpha_num_is_deterministic_for_same_seed() {
        assert_eq!(rand_alpha_num(12, 42), rand_alpha_num(12, 42));
        assert_ne!(rand_alpha_num(12, 42), rand_alpha_num(12, 43));
    }

    #[test]
    fn hash_sha256_is_stable() {
        let out = call("hashSha256", &["hello".to_string()]).unwrap();
        assert_eq!(out, "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
    }

    #[test]
    fn unknown_helper_errors() {
        assert!(matches!(call("doesNotExist", &[]), Err(RenderError::UnknownHelper(_))));
    }
}
