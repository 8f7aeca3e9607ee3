//! Store-credit code generation.

use rand::Rng;

/// Excludes visually confusable characters (0/O, 1/I/L, 2/Z, 5/S).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRTUVWXY346789";

const CODE_GROUPS: usize = 3;
const CODE_GROUP_LEN: usize = 4;

/// Collision retries before giving up. With a 27-character alphabet and 12
/// positions the space is ~1.5e17 codes, so exhausting this is treated as
/// practically impossible.
pub const MAX_CODE_ATTEMPTS: u32 = 5;

/// Generate a store-credit code like `KX7M-Q4RA-HN93`.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let mut groups = Vec::with_capacity(CODE_GROUPS);
    for _ in 0..CODE_GROUPS {
        let group: String = (0..CODE_GROUP_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        groups.push(group);
    }
    groups.join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_shape_is_three_groups_of_four() {
        let code = generate_code();
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), 3);
        for group in groups {
            assert_eq!(group.len(), 4);
        }
    }

    #[test]
    fn code_uses_only_the_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_code();
            for c in code.chars().filter(|c| *c != '-') {
                assert!(
                    CODE_ALPHABET.contains(&(c as u8)),
                    "unexpected character {c} in {code}"
                );
            }
        }
    }

    #[test]
    fn codes_are_not_trivially_repeating() {
        let a = generate_code();
        let b = generate_code();
        // Collisions are possible in principle, just not across two draws
        // from a 1.5e17 space.
        assert_ne!(a, b);
    }
}
