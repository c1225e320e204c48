pub mod state;

use chrono::NaiveDate;
use nom::{
    IResult,
    Parser,
    branch::alt,
    bytes::complete::{ tag, take, take_while1 },
    character::complete::{ char, digit1 },
    combinator::{ map, map_res, opt, success, value },
    error::{ make_error, ErrorKind },
    multi::{ many1, separated_list0, separated_list1 },
    sequence::{ delimited, preceded, separated_pair },
};

use self::state::{
    FetchItem,
    ImapCommand,
    SearchCriteria,
    Section,
    SequenceRange,
    SequenceSet,
    Specifier,
    StatusItem,
    StoreOperation,
    UidCommand,
};

/// Parses one complete command (literals inlined, trailing CRLF removed).
///
/// On failure the tag is returned when it could be read, so the error can
/// still be answered with a tagged BAD.
pub fn parse_command_line(line: &[u8]) -> Result<(String, ImapCommand), Option<String>> {
    match parse_command(line) {
        Ok((rest, (tag, command))) => {
            if rest.is_empty() || matches!(command, ImapCommand::Unknown { .. }) {
                Ok((tag, command))
            } else {
                Err(Some(tag))
            }
        }
        Err(_) => Err(parse_tag(line).ok().map(|(_, tag)| tag)),
    }
}

/// Parse IMAP command line
pub fn parse_command(input: &[u8]) -> IResult<&[u8], (String, ImapCommand)> {
    let (input, tag) = parse_tag(input)?;
    let (input, _) = char(' ').parse(input)?;
    let (input, command) = parse_command_body(input)?;

    Ok((input, (tag, command)))
}

fn parse_tag(input: &[u8]) -> IResult<&[u8], String> {
    map(
        take_while1(|c: u8| is_astring_char(c) && c != b'+'),
        to_string
    ).parse(input)
}

fn parse_command_body(input: &[u8]) -> IResult<&[u8], ImapCommand> {
    let (rest, name) = take_while1(|c: u8| c.is_ascii_alphabetic()).parse(input)?;

    match name.to_ascii_uppercase().as_slice() {
        b"CAPABILITY" => Ok((rest, ImapCommand::Capability)),
        b"NOOP" => Ok((rest, ImapCommand::Noop)),
        b"LOGOUT" => Ok((rest, ImapCommand::Logout)),
        b"STARTTLS" => Ok((rest, ImapCommand::StartTls)),
        b"ID" => parse_id(rest),
        b"LOGIN" => parse_login(rest),
        b"SELECT" => map(arg(parse_mailbox), |mailbox| ImapCommand::Select { mailbox }).parse(rest),
        b"EXAMINE" => map(arg(parse_mailbox), |mailbox| ImapCommand::Examine { mailbox }).parse(rest),
        b"CREATE" => map(arg(parse_mailbox), |mailbox| ImapCommand::Create { mailbox }).parse(rest),
        b"DELETE" => map(arg(parse_mailbox), |mailbox| ImapCommand::Delete { mailbox }).parse(rest),
        b"RENAME" => {
            map((arg(parse_mailbox), arg(parse_mailbox)), |(from, to)| ImapCommand::Rename { from, to }).parse(
                rest
            )
        }
        b"LIST" => {
            map((arg(parse_mailbox), arg(parse_list_mailbox)), |(reference, pattern)| ImapCommand::List {
                reference,
                pattern,
            }).parse(rest)
        }
        b"LSUB" => {
            map((arg(parse_mailbox), arg(parse_list_mailbox)), |(reference, pattern)| ImapCommand::Lsub {
                reference,
                pattern,
            }).parse(rest)
        }
        b"SUBSCRIBE" => map(arg(parse_mailbox), |mailbox| ImapCommand::Subscribe { mailbox }).parse(rest),
        b"UNSUBSCRIBE" => map(arg(parse_mailbox), |mailbox| ImapCommand::Unsubscribe { mailbox }).parse(rest),
        b"STATUS" => parse_status(rest),
        b"APPEND" => parse_append(rest),
        b"GETQUOTA" => map(arg(parse_astring), |root| ImapCommand::GetQuota { root }).parse(rest),
        b"GETQUOTAROOT" => map(arg(parse_mailbox), |mailbox| ImapCommand::GetQuotaRoot { mailbox }).parse(rest),
        b"IDLE" => Ok((rest, ImapCommand::Idle)),
        b"CHECK" => Ok((rest, ImapCommand::Check)),
        b"CLOSE" => Ok((rest, ImapCommand::Close)),
        b"EXPUNGE" => Ok((rest, ImapCommand::Expunge)),
        b"UNSELECT" => Ok((rest, ImapCommand::Unselect)),
        b"SEARCH" => {
            map(parse_search_args, |(charset, criteria)| ImapCommand::Search { criteria, charset }).parse(rest)
        }
        b"FETCH" => {
            map(parse_fetch_args, |(sequence_set, items)| ImapCommand::Fetch { sequence_set, items }).parse(rest)
        }
        b"STORE" => {
            map(parse_store_args, |(sequence_set, operation, silent, flags)| ImapCommand::Store {
                sequence_set,
                operation,
                silent,
                flags,
            }).parse(rest)
        }
        b"COPY" => {
            map(parse_copy_args, |(sequence_set, mailbox)| ImapCommand::Copy { sequence_set, mailbox }).parse(rest)
        }
        b"MOVE" => {
            map(parse_copy_args, |(sequence_set, mailbox)| ImapCommand::Move { sequence_set, mailbox }).parse(rest)
        }
        b"UID" => parse_uid(rest),
        _ => Ok((rest, ImapCommand::Unknown { command: to_string(name) })),
    }
}

fn parse_login(input: &[u8]) -> IResult<&[u8], ImapCommand> {
    let (input, username) = arg(parse_astring).parse(input)?;
    let (input, password) = arg(parse_astring).parse(input)?;

    Ok((input, ImapCommand::Login { username, password }))
}

fn parse_id(input: &[u8]) -> IResult<&[u8], ImapCommand> {
    let (input, params) = arg(
        alt((
            value(Vec::new(), tag_no_case("NIL")),
            delimited(
                char('('),
                separated_list0(char(' '), separated_pair(parse_string, char(' '), parse_nstring)),
                char(')')
            ),
        ))
    ).parse(input)?;

    Ok((input, ImapCommand::Id { params }))
}

fn parse_status(input: &[u8]) -> IResult<&[u8], ImapCommand> {
    let (input, mailbox) = arg(parse_mailbox).parse(input)?;
    let (input, items) = arg(
        delimited(char('('), separated_list1(char(' '), parse_status_item), char(')'))
    ).parse(input)?;

    Ok((input, ImapCommand::Status { mailbox, items }))
}

fn parse_status_item(input: &[u8]) -> IResult<&[u8], StatusItem> {
    alt((
        value(StatusItem::Messages, tag_no_case("MESSAGES")),
        value(StatusItem::Recent, tag_no_case("RECENT")),
        value(StatusItem::UidNext, tag_no_case("UIDNEXT")),
        value(StatusItem::UidValidity, tag_no_case("UIDVALIDITY")),
        value(StatusItem::Unseen, tag_no_case("UNSEEN")),
    )).parse(input)
}

fn parse_append(input: &[u8]) -> IResult<&[u8], ImapCommand> {
    let (input, mailbox) = arg(parse_mailbox).parse(input)?;
    let (input, flags) = opt(arg(parse_flag_list)).parse(input)?;
    let (input, date_time) = opt(arg(parse_quoted)).parse(input)?;
    let (input, message) = arg(parse_literal).parse(input)?;

    Ok((
        input,
        ImapCommand::Append {
            mailbox,
            flags: flags.unwrap_or_default(),
            date_time,
            message: message.to_vec(),
        },
    ))
}

fn parse_fetch_args(input: &[u8]) -> IResult<&[u8], (SequenceSet, Vec<FetchItem>)> {
    (arg(parse_sequence_set), arg(parse_fetch_items)).parse(input)
}

fn parse_copy_args(input: &[u8]) -> IResult<&[u8], (SequenceSet, String)> {
    (arg(parse_sequence_set), arg(parse_mailbox)).parse(input)
}

fn parse_store_args(input: &[u8]) -> IResult<&[u8], (SequenceSet, StoreOperation, bool, Vec<String>)> {
    let (input, sequence_set) = arg(parse_sequence_set).parse(input)?;
    let (input, _) = char(' ').parse(input)?;
    let (input, operation) = alt((
        value(StoreOperation::Add, char('+')),
        value(StoreOperation::Remove, char('-')),
        success(StoreOperation::Replace),
    )).parse(input)?;
    let (input, _) = tag_no_case("FLAGS").parse(input)?;
    let (input, silent) = map(opt(tag_no_case(".SILENT")), |s| s.is_some()).parse(input)?;
    let (input, flags) = arg(alt((parse_flag_list, separated_list1(char(' '), parse_flag)))).parse(input)?;

    Ok((input, (sequence_set, operation, silent, flags)))
}

fn parse_search_args(input: &[u8]) -> IResult<&[u8], (Option<String>, Vec<SearchCriteria>)> {
    let (input, charset) = opt(preceded((char(' '), tag_no_case("CHARSET")), arg(parse_astring))).parse(input)?;
    let (input, criteria) = many1(arg(parse_search_key)).parse(input)?;

    Ok((input, (charset, criteria)))
}

fn parse_uid(input: &[u8]) -> IResult<&[u8], ImapCommand> {
    let (input, _) = char(' ').parse(input)?;
    let (rest, name) = take_while1(|c: u8| c.is_ascii_alphabetic()).parse(input)?;

    let (rest, command) = match name.to_ascii_uppercase().as_slice() {
        b"FETCH" => {
            map(parse_fetch_args, |(sequence_set, items)| UidCommand::Fetch { sequence_set, items }).parse(rest)?
        }
        b"SEARCH" => {
            map(parse_search_args, |(charset, criteria)| UidCommand::Search { criteria, charset }).parse(rest)?
        }
        b"STORE" => {
            map(parse_store_args, |(sequence_set, operation, silent, flags)| UidCommand::Store {
                sequence_set,
                operation,
                silent,
                flags,
            }).parse(rest)?
        }
        b"COPY" => {
            map(parse_copy_args, |(sequence_set, mailbox)| UidCommand::Copy { sequence_set, mailbox }).parse(rest)?
        }
        b"MOVE" => {
            map(parse_copy_args, |(sequence_set, mailbox)| UidCommand::Move { sequence_set, mailbox }).parse(rest)?
        }
        b"EXPUNGE" => {
            map(arg(parse_sequence_set), |sequence_set| UidCommand::Expunge { sequence_set }).parse(rest)?
        }
        _ => {
            return Err(nom::Err::Error(make_error(input, ErrorKind::Tag)));
        }
    };

    Ok((rest, ImapCommand::Uid { command: Box::new(command) }))
}

/** ---------------------------------------------------------------
 * -------------------------- FETCH items --------------------------
 * --------------------------------------------------------------- */

fn parse_fetch_items(input: &[u8]) -> IResult<&[u8], Vec<FetchItem>> {
    use FetchItem::*;

    alt((
        value(vec![Flags, InternalDate, Rfc822Size, Envelope], keyword("ALL")),
        value(vec![Flags, InternalDate, Rfc822Size], keyword("FAST")),
        value(vec![Flags, InternalDate, Rfc822Size, Envelope, Body], keyword("FULL")),
        delimited(char('('), separated_list1(char(' '), parse_fetch_item), char(')')),
        map(parse_fetch_item, |item| vec![item]),
    )).parse(input)
}

fn parse_fetch_item(input: &[u8]) -> IResult<&[u8], FetchItem> {
    alt((
        value(FetchItem::BodyStructure, tag_no_case("BODYSTRUCTURE")),
        parse_body_section,
        value(FetchItem::Body, tag_no_case("BODY")),
        value(FetchItem::Rfc822Header, tag_no_case("RFC822.HEADER")),
        value(FetchItem::Rfc822Size, tag_no_case("RFC822.SIZE")),
        value(FetchItem::Rfc822Text, tag_no_case("RFC822.TEXT")),
        value(FetchItem::Rfc822, tag_no_case("RFC822")),
        value(FetchItem::Envelope, tag_no_case("ENVELOPE")),
        value(FetchItem::Flags, tag_no_case("FLAGS")),
        value(FetchItem::InternalDate, tag_no_case("INTERNALDATE")),
        value(FetchItem::Uid, tag_no_case("UID")),
    )).parse(input)
}

fn parse_body_section(input: &[u8]) -> IResult<&[u8], FetchItem> {
    let (input, peek) = alt((
        value(true, tag_no_case("BODY.PEEK[")),
        value(false, tag_no_case("BODY[")),
    )).parse(input)?;
    let (input, section) = parse_section(input)?;
    let (input, _) = char(']').parse(input)?;
    let (input, partial) = opt(
        delimited(char('<'), separated_pair(parse_number, char('.'), parse_number), char('>'))
    ).parse(input)?;

    Ok((input, FetchItem::BodySection { section, partial, peek }))
}

fn parse_section(input: &[u8]) -> IResult<&[u8], Section> {
    let (input, path) = separated_list0(char('.'), map(parse_nz_number, |n| n as usize)).parse(input)?;
    let (input, specifier) = if path.is_empty() {
        opt(parse_specifier).parse(input)?
    } else {
        opt(preceded(char('.'), parse_specifier)).parse(input)?
    };

    Ok((input, Section { path, specifier: specifier.unwrap_or(Specifier::Entire) }))
}

fn parse_specifier(input: &[u8]) -> IResult<&[u8], Specifier> {
    alt((
        map(preceded((tag_no_case("HEADER.FIELDS.NOT"), char(' ')), parse_header_list), Specifier::HeaderFieldsNot),
        map(preceded((tag_no_case("HEADER.FIELDS"), char(' ')), parse_header_list), Specifier::HeaderFields),
        value(Specifier::Header, tag_no_case("HEADER")),
        value(Specifier::Text, tag_no_case("TEXT")),
        value(Specifier::Mime, tag_no_case("MIME")),
    )).parse(input)
}

fn parse_header_list(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(
        char('('),
        separated_list1(
            char(' '),
            map(parse_astring, |s| s.to_ascii_uppercase())
        ),
        char(')')
    ).parse(input)
}

/** ---------------------------------------------------------------
 * -------------------------- SEARCH keys --------------------------
 * --------------------------------------------------------------- */

fn parse_search_key(input: &[u8]) -> IResult<&[u8], SearchCriteria> {
    match input.first() {
        Some(b'(') => {
            return map(
                delimited(char('('), separated_list1(char(' '), parse_search_key), char(')')),
                SearchCriteria::And
            ).parse(input);
        }
        Some(c) if c.is_ascii_digit() || *c == b'*' => {
            return map(parse_sequence_set, SearchCriteria::SequenceSet).parse(input);
        }
        _ => {}
    }

    let (rest, name) = take_while1(|c: u8| c.is_ascii_alphabetic()).parse(input)?;
    let word = name.to_ascii_uppercase();

    let simple = match word.as_slice() {
        b"ALL" => Some(SearchCriteria::All),
        b"ANSWERED" => Some(SearchCriteria::Answered),
        b"DELETED" => Some(SearchCriteria::Deleted),
        b"DRAFT" => Some(SearchCriteria::Draft),
        b"FLAGGED" => Some(SearchCriteria::Flagged),
        b"NEW" => Some(SearchCriteria::New),
        b"OLD" => Some(SearchCriteria::Old),
        b"RECENT" => Some(SearchCriteria::Recent),
        b"SEEN" => Some(SearchCriteria::Seen),
        b"UNANSWERED" => Some(SearchCriteria::Unanswered),
        b"UNDELETED" => Some(SearchCriteria::Undeleted),
        b"UNDRAFT" => Some(SearchCriteria::Undraft),
        b"UNFLAGGED" => Some(SearchCriteria::Unflagged),
        b"UNSEEN" => Some(SearchCriteria::Unseen),
        _ => None,
    };
    if let Some(criteria) = simple {
        return Ok((rest, criteria));
    }

    match word.as_slice() {
        b"BCC" => map(arg(parse_astring), SearchCriteria::Bcc).parse(rest),
        b"BODY" => map(arg(parse_astring), SearchCriteria::Body).parse(rest),
        b"CC" => map(arg(parse_astring), SearchCriteria::Cc).parse(rest),
        b"FROM" => map(arg(parse_astring), SearchCriteria::From).parse(rest),
        b"SUBJECT" => map(arg(parse_astring), SearchCriteria::Subject).parse(rest),
        b"TEXT" => map(arg(parse_astring), SearchCriteria::Text).parse(rest),
        b"TO" => map(arg(parse_astring), SearchCriteria::To).parse(rest),
        b"KEYWORD" => map(arg(parse_flag), SearchCriteria::Keyword).parse(rest),
        b"UNKEYWORD" => map(arg(parse_flag), SearchCriteria::Unkeyword).parse(rest),
        b"HEADER" => {
            map((arg(parse_astring), arg(parse_astring)), |(name, value)| SearchCriteria::Header(name, value)).parse(
                rest
            )
        }
        b"BEFORE" => map(arg(parse_date), SearchCriteria::Before).parse(rest),
        b"ON" => map(arg(parse_date), SearchCriteria::On).parse(rest),
        b"SINCE" => map(arg(parse_date), SearchCriteria::Since).parse(rest),
        b"SENTBEFORE" => map(arg(parse_date), SearchCriteria::SentBefore).parse(rest),
        b"SENTON" => map(arg(parse_date), SearchCriteria::SentOn).parse(rest),
        b"SENTSINCE" => map(arg(parse_date), SearchCriteria::SentSince).parse(rest),
        b"LARGER" => map(arg(parse_number), SearchCriteria::Larger).parse(rest),
        b"SMALLER" => map(arg(parse_number), SearchCriteria::Smaller).parse(rest),
        b"UID" => map(arg(parse_sequence_set), SearchCriteria::Uid).parse(rest),
        b"NOT" => map(arg(parse_search_key), |key| SearchCriteria::Not(Box::new(key))).parse(rest),
        b"OR" => {
            map((arg(parse_search_key), arg(parse_search_key)), |(a, b)| {
                SearchCriteria::Or(Box::new(a), Box::new(b))
            }).parse(rest)
        }
        _ => Err(nom::Err::Error(make_error(input, ErrorKind::Tag))),
    }
}

fn parse_date(input: &[u8]) -> IResult<&[u8], NaiveDate> {
    map_res(
        alt((parse_quoted, map(take_while1(is_atom_char), to_string))),
        |text: String| NaiveDate::parse_from_str(&text, "%d-%b-%Y")
    ).parse(input)
}

/** ---------------------------------------------------------------
 * --------------------------- Primitives --------------------------
 * --------------------------------------------------------------- */

fn to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn is_atom_char(c: u8) -> bool {
    c > 0x20 && c < 0x7f && !b"(){%*\"\\]".contains(&c)
}

fn is_astring_char(c: u8) -> bool {
    is_atom_char(c) || c == b']'
}

fn is_list_char(c: u8) -> bool {
    is_astring_char(c) || c == b'%' || c == b'*'
}

/// A space followed by `parser`.
fn arg<'a, O, P>(parser: P) -> impl Parser<&'a [u8], Output = O, Error = nom::error::Error<&'a [u8]>>
    where P: Parser<&'a [u8], Output = O, Error = nom::error::Error<&'a [u8]>>
{
    preceded(char(' '), parser)
}

fn tag_no_case(tag: &'static str) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input: &[u8]| {
        let tag = tag.as_bytes();
        if input.len() >= tag.len() && input[..tag.len()].eq_ignore_ascii_case(tag) {
            Ok((&input[tag.len()..], &input[..tag.len()]))
        } else {
            Err(nom::Err::Error(make_error(input, ErrorKind::Tag)))
        }
    }
}

/// Case-insensitive word that must not run on into an atom.
fn keyword(word: &'static str) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input: &[u8]| {
        let (rest, matched) = tag_no_case(word)(input)?;
        match rest.first() {
            Some(&c) if is_atom_char(c) => Err(nom::Err::Error(make_error(input, ErrorKind::Tag))),
            _ => Ok((rest, matched)),
        }
    }
}

fn parse_number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(digit1, |digits: &[u8]| to_string(digits).parse::<u32>()).parse(input)
}

fn parse_nz_number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(parse_number, |n| if n == 0 { Err("zero") } else { Ok(n) }).parse(input)
}

fn parse_quoted(input: &[u8]) -> IResult<&[u8], String> {
    let (mut rest, _) = char('"').parse(input)?;
    let mut out = Vec::new();

    loop {
        match rest.first() {
            None | Some(b'\r') | Some(b'\n') => {
                return Err(nom::Err::Error(make_error(rest, ErrorKind::Char)));
            }
            Some(b'"') => {
                return Ok((&rest[1..], to_string(&out)));
            }
            Some(b'\\') => {
                let Some(&escaped) = rest.get(1) else {
                    return Err(nom::Err::Error(make_error(rest, ErrorKind::Escaped)));
                };
                out.push(escaped);
                rest = &rest[2..];
            }
            Some(&c) => {
                out.push(c);
                rest = &rest[1..];
            }
        }
    }
}

/// `{n}` or `{n+}`, CRLF, then `n` bytes.
fn parse_literal(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, length) = delimited(char('{'), parse_number, (opt(char('+')), char('}'))).parse(input)?;
    let (input, _) = tag(&b"\r\n"[..]).parse(input)?;
    take(length as usize).parse(input)
}

fn parse_string(input: &[u8]) -> IResult<&[u8], String> {
    alt((parse_quoted, map(parse_literal, to_string))).parse(input)
}

fn parse_nstring(input: &[u8]) -> IResult<&[u8], Option<String>> {
    alt((value(None, keyword("NIL")), map(parse_string, Some))).parse(input)
}

fn parse_astring(input: &[u8]) -> IResult<&[u8], String> {
    alt((map(take_while1(is_astring_char), to_string), parse_string)).parse(input)
}

fn parse_mailbox(input: &[u8]) -> IResult<&[u8], String> {
    map(parse_astring, |name| {
        if name.eq_ignore_ascii_case("INBOX") { "INBOX".to_string() } else { name }
    }).parse(input)
}

fn parse_list_mailbox(input: &[u8]) -> IResult<&[u8], String> {
    alt((map(take_while1(is_list_char), to_string), parse_string)).parse(input)
}

fn parse_flag(input: &[u8]) -> IResult<&[u8], String> {
    alt((
        map(preceded(char('\\'), take_while1(is_atom_char)), |name: &[u8]| format!("\\{}", to_string(name))),
        map(take_while1(is_atom_char), to_string),
    )).parse(input)
}

fn parse_flag_list(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(char('('), separated_list0(char(' '), parse_flag), char(')')).parse(input)
}

fn parse_sequence_set(input: &[u8]) -> IResult<&[u8], SequenceSet> {
    map(separated_list1(char(','), parse_sequence_range), |ranges| SequenceSet { ranges }).parse(input)
}

fn parse_sequence_range(input: &[u8]) -> IResult<&[u8], SequenceRange> {
    let (input, start) = parse_seq_number(input)?;
    let (input, stop) = opt(preceded(char(':'), parse_seq_number)).parse(input)?;

    Ok((input, SequenceRange { start, stop: stop.unwrap_or(start) }))
}

fn parse_seq_number(input: &[u8]) -> IResult<&[u8], u32> {
    alt((value(0, char('*')), parse_nz_number)).parse(input)
}

/// Length of the literal announced at the end of a command line, and
/// whether the client waits for a continuation before sending it.
pub fn literal_suffix(line: &[u8]) -> Option<(usize, bool)> {
    let line = line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n"))?;
    let inner = line.strip_suffix(b"}")?;
    let open = inner.iter().rposition(|&c| c == b'{')?;
    let spec = &inner[open + 1..];
    let (digits, synchronizing) = match spec.strip_suffix(b"+") {
        Some(digits) => (digits, false),
        None => (spec, true),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let length = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some((length, synchronizing))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> (String, ImapCommand) {
        parse_command_line(line.as_bytes()).unwrap()
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("a1 CAPABILITY"), ("a1".to_string(), ImapCommand::Capability));
        assert_eq!(parse("a2 noop").1, ImapCommand::Noop);
        assert_eq!(parse("a3 IDLE").1, ImapCommand::Idle);
        assert_eq!(parse("a4 LOGIN alice@example.com \"pa ss\"").1, ImapCommand::Login {
            username: "alice@example.com".to_string(),
            password: "pa ss".to_string(),
        });
        assert_eq!(parse("a5 select inbox").1, ImapCommand::Select { mailbox: "INBOX".to_string() });
        assert_eq!(parse("a6 LIST \"\" *").1, ImapCommand::List {
            reference: String::new(),
            pattern: "*".to_string(),
        });
        assert!(matches!(parse("a7 XYZZY foo").1, ImapCommand::Unknown { .. }));
    }

    #[test]
    fn test_trailing_garbage_is_rejected_with_tag() {
        assert_eq!(parse_command_line(b"a1 NOOP extra"), Err(Some("a1".to_string())));
        assert_eq!(parse_command_line(b"a1 SELECT"), Err(Some("a1".to_string())));
        assert_eq!(parse_command_line(b"+"), Err(None));
    }

    #[test]
    fn test_literal_arguments() {
        let (_, command) = parse_command_line(b"a1 LOGIN {5}\r\nalice {3+}\r\npw!").unwrap();
        assert_eq!(command, ImapCommand::Login { username: "alice".to_string(), password: "pw!".to_string() });

        let (_, command) = parse_command_line(
            b"a2 APPEND Sent (\\Seen) \"13-Sep-2020 12:26:40 +0000\" {10}\r\nSubject: x"
        ).unwrap();
        assert_eq!(command, ImapCommand::Append {
            mailbox: "Sent".to_string(),
            flags: vec!["\\Seen".to_string()],
            date_time: Some("13-Sep-2020 12:26:40 +0000".to_string()),
            message: b"Subject: x".to_vec(),
        });
    }

    #[test]
    fn test_literal_length_mismatch_is_rejected() {
        assert_eq!(
            parse_command_line(b"a2 APPEND Sent {9}\r\nSubject: x"),
            Err(Some("a2".to_string()))
        );
        assert_eq!(
            parse_command_line(b"a3 APPEND Sent {12}\r\nSubject: x"),
            Err(Some("a3".to_string()))
        );
    }

    #[test]
    fn test_sequence_sets() {
        let (_, command) = parse("a1 FETCH 1:3,5,7:* FLAGS");
        let ImapCommand::Fetch { sequence_set, items } = command else {
            panic!("not a fetch");
        };
        assert_eq!(items, vec![FetchItem::Flags]);
        assert_eq!(sequence_set.ranges, vec![
            SequenceRange { start: 1, stop: 3 },
            SequenceRange { start: 5, stop: 5 },
            SequenceRange { start: 7, stop: 0 },
        ]);
        assert!(sequence_set.is_dynamic());
        assert!(sequence_set.contains(9, 9));
        assert!(!sequence_set.contains(4, 9));
        assert!(parse_command_line(b"a1 FETCH 0 FLAGS").is_err());
    }

    #[test]
    fn test_fetch_items() {
        let (_, command) = parse("a1 UID FETCH 1:* (UID BODY.PEEK[HEADER.FIELDS (From To)] BODY[1.2.MIME] BODY[]<0.100> RFC822.SIZE)");
        let ImapCommand::Uid { command } = command else {
            panic!("not a UID command");
        };
        let UidCommand::Fetch { items, .. } = *command else {
            panic!("not a UID FETCH");
        };
        assert_eq!(items, vec![
            FetchItem::Uid,
            FetchItem::BodySection {
                section: Section {
                    path: vec![],
                    specifier: Specifier::HeaderFields(vec!["FROM".to_string(), "TO".to_string()]),
                },
                partial: None,
                peek: true,
            },
            FetchItem::BodySection {
                section: Section { path: vec![1, 2], specifier: Specifier::Mime },
                partial: None,
                peek: false,
            },
            FetchItem::BodySection { section: Section::entire(), partial: Some((0, 100)), peek: false },
            FetchItem::Rfc822Size,
        ]);

        let (_, command) = parse("a2 FETCH 1 FULL");
        assert!(matches!(command, ImapCommand::Fetch { ref items, .. } if items.len() == 5));
    }

    #[test]
    fn test_section_names() {
        let section = Section { path: vec![1, 2], specifier: Specifier::HeaderFields(vec!["TO".to_string()]) };
        assert_eq!(section.name(), "1.2.HEADER.FIELDS (TO)");
        assert_eq!(Section { path: vec![3], specifier: Specifier::Entire }.name(), "3");
        assert_eq!(Section::entire().name(), "");
    }

    #[test]
    fn test_store() {
        let (_, command) = parse("a1 STORE 2:4 +FLAGS.SILENT (\\Seen \\Flagged)");
        assert_eq!(command, ImapCommand::Store {
            sequence_set: SequenceSet { ranges: vec![SequenceRange { start: 2, stop: 4 }] },
            operation: StoreOperation::Add,
            silent: true,
            flags: vec!["\\Seen".to_string(), "\\Flagged".to_string()],
        });

        let (_, command) = parse("a2 UID STORE 9 FLAGS $Junk");
        let ImapCommand::Uid { command } = command else {
            panic!("not a UID command");
        };
        assert!(matches!(*command, UidCommand::Store { operation: StoreOperation::Replace, silent: false, ref flags, .. } if flags == &vec!["$Junk".to_string()]));
    }

    #[test]
    fn test_search() {
        let (_, command) = parse("a1 SEARCH CHARSET UTF-8 UNSEEN SINCE 1-Feb-2020 FROM \"bob\" 1:5 NOT DELETED");
        let ImapCommand::Search { criteria, charset } = command else {
            panic!("not a search");
        };
        assert_eq!(charset, Some("UTF-8".to_string()));
        assert_eq!(criteria, vec![
            SearchCriteria::Unseen,
            SearchCriteria::Since(NaiveDate::from_ymd_opt(2020, 2, 1).unwrap()),
            SearchCriteria::From("bob".to_string()),
            SearchCriteria::SequenceSet(SequenceSet { ranges: vec![SequenceRange { start: 1, stop: 5 }] }),
            SearchCriteria::Not(Box::new(SearchCriteria::Deleted)),
        ]);

        let (_, command) = parse("a2 UID SEARCH (OR SEEN FLAGGED) UID 4:*");
        assert!(matches!(command, ImapCommand::Uid { .. }));
    }

    #[test]
    fn test_status_and_id() {
        let (_, command) = parse("a1 STATUS \"All Mail\" (MESSAGES UIDNEXT UNSEEN)");
        assert_eq!(command, ImapCommand::Status {
            mailbox: "All Mail".to_string(),
            items: vec![StatusItem::Messages, StatusItem::UidNext, StatusItem::Unseen],
        });

        let (_, command) = parse("a2 ID (\"name\" \"Thunderbird\" \"version\" NIL)");
        assert_eq!(command, ImapCommand::Id {
            params: vec![("name".to_string(), Some("Thunderbird".to_string())), ("version".to_string(), None)],
        });
        assert_eq!(parse("a3 ID NIL").1, ImapCommand::Id { params: vec![] });
    }

    #[test]
    fn test_literal_suffix() {
        assert_eq!(literal_suffix(b"a1 APPEND INBOX {310}\r\n"), Some((310, true)));
        assert_eq!(literal_suffix(b"a1 LOGIN {5+}\r\n"), Some((5, false)));
        assert_eq!(literal_suffix(b"a1 NOOP\r\n"), None);
        assert_eq!(literal_suffix(b"a1 SELECT {x}\r\n"), None);
    }
}
