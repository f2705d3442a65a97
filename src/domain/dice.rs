//! D&D-style dice rolling.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Result of a dice roll, with the individual die results preserved for the
/// combat log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiceRoll {
    /// Notation as rolled, e.g. "1d20" or "2d6+3".
    pub dice: String,
    pub rolls: Vec<i32>,
    pub modifier: i32,
    pub total: i32,
}

/// Parse "NdS", "NdS+M" or "NdS-M". Whitespace and case are ignored.
fn parse_notation(notation: &str) -> Option<(u32, u32, i32)> {
    let cleaned: String = notation
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    let (count_part, rest) = cleaned.split_once('d')?;
    let num_dice: u32 = count_part.parse().ok()?;

    let (sides_part, modifier) = if let Some(pos) = rest.find(['+', '-']) {
        let (sides, modifier) = rest.split_at(pos);
        (sides, modifier.parse::<i32>().ok()?)
    } else {
        (rest, 0)
    };
    let die_size: u32 = sides_part.parse().ok()?;
    if num_dice == 0 || die_size == 0 {
        return None;
    }
    Some((num_dice, die_size, modifier))
}

/// Roll dice using standard notation. Unparseable notation degrades to a
/// plain 1d20. The total is clamped at 0.
pub fn roll_dice(notation: &str) -> DiceRoll {
    let mut rng = rand::thread_rng();
    let Some((num_dice, die_size, modifier)) = parse_notation(notation) else {
        let roll = rng.gen_range(1..=20);
        return DiceRoll {
            dice: "1d20".to_string(),
            rolls: vec![roll],
            modifier: 0,
            total: roll,
        };
    };

    let rolls: Vec<i32> = (0..num_dice)
        .map(|_| rng.gen_range(1..=die_size as i32))
        .collect();
    let total = rolls.iter().sum::<i32>() + modifier;

    DiceRoll {
        dice: notation.to_string(),
        rolls,
        modifier,
        total: total.max(0),
    }
}

/// Roll a d20 with an optional modifier. The total is not clamped so a
/// penalized roll can go below zero.
pub fn roll_d20(modifier: i32) -> DiceRoll {
    let roll = rand::thread_rng().gen_range(1..=20);
    let notation = match modifier {
        m if m > 0 => format!("1d20+{m}"),
        m if m < 0 => format!("1d20{m}"),
        _ => "1d20".to_string(),
    };
    DiceRoll {
        dice: notation,
        rolls: vec![roll],
        modifier,
        total: roll + modifier,
    }
}

/// Roll a d20 attack against a target AC.
///
/// Returns `(roll, hit, critical)`. A natural 20 always hits and crits, a
/// natural 1 always misses regardless of modifiers.
pub fn roll_attack(attack_bonus: i32, target_ac: i32) -> (DiceRoll, bool, bool) {
    let roll = roll_d20(attack_bonus);
    let natural = roll.rolls[0];
    resolve_attack(roll, natural, target_ac)
}

/// Pure attack resolution, split out so combat outcomes are testable with
/// forced rolls.
pub fn resolve_attack(roll: DiceRoll, natural: i32, target_ac: i32) -> (DiceRoll, bool, bool) {
    let is_critical = natural == 20;
    let is_fumble = natural == 1;
    let hit = if is_critical {
        true
    } else if is_fumble {
        false
    } else {
        roll.total >= target_ac
    };
    (roll, hit, is_critical)
}

/// Roll damage dice, doubling the number of dice on a critical hit while
/// keeping the modifier once.
pub fn roll_damage(damage_dice: &str, is_critical: bool) -> DiceRoll {
    if is_critical {
        if let Some((num_dice, die_size, modifier)) = parse_notation(damage_dice) {
            let doubled = match modifier {
                m if m > 0 => format!("{}d{}+{}", num_dice * 2, die_size, m),
                m if m < 0 => format!("{}d{}{}", num_dice * 2, die_size, m),
                _ => format!("{}d{}", num_dice * 2, die_size),
            };
            return roll_dice(&doubled);
        }
    }
    roll_dice(damage_dice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notation() {
        assert_eq!(parse_notation("1d20"), Some((1, 20, 0)));
        assert_eq!(parse_notation("2d6+3"), Some((2, 6, 3)));
        assert_eq!(parse_notation("1d8-2"), Some((1, 8, -2)));
        assert_eq!(parse_notation(" 3 D 4 "), Some((3, 4, 0)));
        assert_eq!(parse_notation("garbage"), None);
        assert_eq!(parse_notation("0d6"), None);
        assert_eq!(parse_notation("1d0"), None);
    }

    #[test]
    fn test_roll_dice_in_range() {
        for _ in 0..100 {
            let roll = roll_dice("2d6+1");
            assert_eq!(roll.rolls.len(), 2);
            assert!(roll.rolls.iter().all(|&r| (1..=6).contains(&r)));
            assert_eq!(roll.total, roll.rolls.iter().sum::<i32>() + 1);
        }
    }

    #[test]
    fn test_invalid_notation_degrades_to_d20() {
        let roll = roll_dice("not dice");
        assert_eq!(roll.dice, "1d20");
        assert_eq!(roll.rolls.len(), 1);
        assert_eq!(roll.modifier, 0);
        assert!((1..=20).contains(&roll.total));
    }

    #[test]
    fn test_negative_total_clamped() {
        // 1d1-5 always rolls 1 for a raw total of -4
        let roll = roll_dice("1d1-5");
        assert_eq!(roll.total, 0);
    }

    #[test]
    fn test_natural_twenty_always_hits_and_crits() {
        let roll = DiceRoll {
            dice: "1d20".into(),
            rolls: vec![20],
            modifier: -10,
            total: 10,
        };
        let (_, hit, crit) = resolve_attack(roll, 20, 30);
        assert!(hit);
        assert!(crit);
    }

    #[test]
    fn test_natural_one_always_misses() {
        let roll = DiceRoll {
            dice: "1d20".into(),
            rolls: vec![1],
            modifier: 20,
            total: 21,
        };
        let (_, hit, crit) = resolve_attack(roll, 1, 5);
        assert!(!hit);
        assert!(!crit);
    }

    #[test]
    fn test_attack_vs_ac() {
        let roll = DiceRoll {
            dice: "1d20+2".into(),
            rolls: vec![10],
            modifier: 2,
            total: 12,
        };
        let (_, hit, _) = resolve_attack(roll.clone(), 10, 12);
        assert!(hit);
        let (_, hit, _) = resolve_attack(roll, 10, 13);
        assert!(!hit);
    }

    #[test]
    fn test_critical_damage_doubles_dice() {
        for _ in 0..50 {
            let normal = roll_damage("2d6+1", false);
            let crit = roll_damage("2d6+1", true);
            assert_eq!(normal.rolls.len(), 2);
            assert_eq!(crit.rolls.len(), 4);
            assert_eq!(crit.modifier, 1);
        }
    }

    #[test]
    fn test_attack_roll_outcomes_consistent() {
        for _ in 0..200 {
            let (roll, hit, crit) = roll_attack(3, 12);
            let natural = roll.rolls[0];
            if natural == 20 {
                assert!(hit && crit);
            } else if natural == 1 {
                assert!(!hit);
            } else {
                assert_eq!(hit, roll.total >= 12);
                assert!(!crit);
            }
        }
    }
}
