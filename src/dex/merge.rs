//! Class pool merging.

use std::collections::HashSet;

use log::debug;

use crate::dex::pool::DexPool;

/// Merges the classes of `secondary` into `primary`. When both pools define
/// the same type the primary definition is kept and the secondary one is
/// dropped. Returns the number of dropped definitions.
pub fn merge_into(primary: &mut DexPool, secondary: DexPool) -> usize
{
    let existing: HashSet<String> =
        primary.classes.iter().map(|c| c.descriptor.clone()).collect();

    let mut dropped = 0;
    for class in secondary.classes
    {
        if existing.contains(&class.descriptor)
        {
            debug!("merge: keeping existing definition of {}", class.descriptor);
            dropped += 1;
        }
        else
        {
            primary.classes.push(class);
        }
    }
    dropped
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dex::pool::{AccessFlags, ClassDef};

    fn class(descriptor: &str, source: &str) -> ClassDef
    {
        let mut c = ClassDef::new(descriptor, AccessFlags::PUBLIC, "Ljava/lang/Object;");
        c.source_file = Some(source.to_string());
        c
    }

    #[test]
    fn primary_wins_collisions()
    {
        let mut primary = DexPool { classes: vec![class("La/B;", "primary.java")] };
        let secondary = DexPool {
            classes: vec![class("La/B;", "secondary.java"), class("La/C;", "other.java")],
        };

        let dropped = merge_into(&mut primary, secondary);

        assert_eq!(dropped, 1);
        assert_eq!(primary.classes.len(), 2);
        assert_eq!(
            primary.class("La/B;").unwrap().source_file.as_deref(),
            Some("primary.java")
        );
        assert!(primary.class("La/C;").is_some());
    }
}
