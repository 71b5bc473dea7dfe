//! Static deny-list of scripted low-value phrases
//!
//! Prayer-altar ceremonies, god-book preaches, minigame taunts and the lines
//! raid mistake trackers shout automatically. Matching is exact.

use ahash::AHashSet;

const SPAM_PHRASES: &[&str] = &[
    // God books and ceremonies
    "In the name of Saradomin, protector of us all, I now join you in the eyes of Saradomin.",
    "Thy cause was false, thy skills did lack; See you in Lumbridge when you get back.",
    "Go in peace in the name of Saradomin; May his glory shine upon you like the sun.",
    "The currency of goodness is honour; It retains its value through scarcity. This is Saradomin's wisdom.",
    "Two great warriors, joined by hand, to spread destruction across the land. In Zamorak's name, now two are one.",
    "The weak deserve to die, so the strong may flourish. This is the creed of Zamorak.",
    "May your bloodthirst never be sated, and may all your battles be glorious. Zamorak bring you strength.",
    "There is no opinion that cannot be proven true...by crushing those who choose to disagree with it. Zamorak give me strength!",
    "Battles are not lost and won; They simply remove the weak from the equation. Zamorak give me strength!",
    "Those who fight, then run away, shame Zamorak with their cowardice. Zamorak give me strength!",
    "Battle is by those who choose to disagree with it. Zamorak give me strength!",
    "Strike fast, strike hard, strike true: The strength of Zamorak will be with you. Zamorak give me strength!",
    "Light and dark, day and night, balance arises from contrast. I unify thee in the name of Guthix.",
    "Thy death was not in vain, for it brought some balance to the world. May Guthix bring you rest.",
    "May you walk the path, and never fall, for Guthix walks beside thee on thy journey. May Guthix bring you peace.",
    "The trees, the earth, the sky, the waters; All play their part upon this land. May Guthix bring you balance.",
    "Big High War God want great warriors. Because you can make more... I bind you in Big High War God name.",
    "You not worthy of Big High War God; you die too easy.",
    "Big High War God make you strong... so you smash enemies.",
    "War is best, peace is for weak. If you not worthy of Big High War God... you get made dead soon.",
    "As ye vow to be at peace with each other... and to uphold high values of morality and friendship... I now pronounce you united in the law of Armadyl.",
    "Thou didst fight true... but the foe was too great. May thy return be as swift as the flight of Armadyl.",
    "For thy task is lawful... May the blessing of Armadyl be upon thee.",
    "Peace shall bring thee wisdom; Wisdom shall bring thee peace. This is the law of Armadyl.",
    "Ye faithful and loyal to the Great Lord... May ye together succeed in your deeds. Ye are now joined by the greatest power.",
    "Thy faith faltered, no power could save thee. Like the Great Lord, one day you shall rise again.",
    "By day or night, in defeat or victory... the power of the Great Lord be with thee.",
    "Follower of the Great Lord be relieved: One day your loyalty will be rewarded. Power to the Great Lord!",
    // Emotes and minigame shouts
    "Just say neigh to gambling!",
    "Eww stinky!",
    "I will burn with you.",
    "Burn with me!",
    "Here fishy fishies!",
    "For Camelot!",
    "Raarrrrrgggggghhhhhhh",
    "Taste vengeance!",
    "Smashing!",
    "*yawn*",
    // Theatre of Blood mistake tracker
    "I'm planking!",
    "I'm drowning in Maiden's blood!",
    "I'm stunned!",
    "Bye!",
    "I'm eating cabbages!",
    "I can't count to four!",
    "I'm PKing my team!",
    "I was stuck in a web!",
    "I'm healing Verzik!",
    // Tombs of Amascut mistake tracker
    "Argh! It burns!",
    "Come on and slam!",
    "Ah! It burns!",
    "Embrace Darkness!",
    "I'm too slow!",
    "I'm griefing!",
    "?",
    "This jug feels a little light...",
    "I'm drowning in acid!",
    "I'm on a blood cloud!",
    "Nihil!",
    "I'm surfing!",
    "I'm exploding!",
    "The swarms are going in!",
    "I've been hatched!",
    "I'm fuming!",
    "The sky is falling!",
    "I've been corrupted!",
    "It's venomous!",
    "Come on and slam!|And welcome to the jam!",
    "I got rocked!",
    "They see me rollin'...",
    "It's raining!",
    "Who put that there?",
    "I'm going down!",
    "I'm disco-ing!",
    "I'm dancing!",
    "I'm winded!",
    "I'm getting bombed!",
    "I'm in jail!",
    "What even was that attack?",
    "I'm tripping!",
];

/// Immutable exact-match phrase set
#[derive(Debug, Clone)]
pub struct SpamFilter {
    phrases: AHashSet<&'static str>,
}

impl SpamFilter {
    pub fn new() -> Self {
        Self {
            phrases: SPAM_PHRASES.iter().copied().collect(),
        }
    }

    /// O(1) exact lookup
    pub fn is_spam(&self, body: &str) -> bool {
        self.phrases.contains(body)
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// The built-in phrase list
    pub fn phrases() -> &'static [&'static str] {
        SPAM_PHRASES
    }
}

impl Default for SpamFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_every_listed_phrase_is_spam() {
        let filter = SpamFilter::new();
        for phrase in SpamFilter::phrases() {
            assert!(filter.is_spam(phrase), "{:?} should be spam", phrase);
        }
    }

    #[test]
    fn test_near_misses_are_not_spam() {
        let filter = SpamFilter::new();
        assert!(!filter.is_spam(""));
        assert!(!filter.is_spam("bye!"));
        assert!(!filter.is_spam("I'm planking! "));
        assert!(!filter.is_spam("??"));
    }

    proptest! {
        #[test]
        fn prop_unlisted_strings_are_not_spam(s in ".{0,40}") {
            let filter = SpamFilter::new();
            prop_assert_eq!(filter.is_spam(&s), SPAM_PHRASES.contains(&s.as_str()));
        }

        #[test]
        fn prop_lookup_is_order_independent(a in ".{0,20}", b in ".{0,20}") {
            let filter = SpamFilter::new();
            let first = (filter.is_spam(&a), filter.is_spam(&b));
            let second = (filter.is_spam(&b), filter.is_spam(&a));
            prop_assert_eq!(first, (second.1, second.0));
        }
    }
}
